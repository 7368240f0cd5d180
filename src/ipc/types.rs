use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::cache::TtlCache;
use crate::config::DaemonConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub config: DaemonConfig,
    /// Dashboard payloads keyed by school year ("*" for all years).
    pub dashboard_cache: TtlCache<String, serde_json::Value>,
}

impl AppState {
    pub fn new(config: DaemonConfig) -> Self {
        let dashboard_cache = TtlCache::new(config.dashboard_ttl);
        Self {
            workspace: None,
            db: None,
            config,
            dashboard_cache,
        }
    }
}
