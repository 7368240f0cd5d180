use crate::cache::TtlCache;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use crate::retry::retry_with_backoff;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

/// Workspace override for the dashboard cache TTL, in seconds.
pub const DASHBOARD_TTL_SETTING: &str = "dashboard.cacheTtlSecs";

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "dashboardCacheEntries": state.dashboard_cache.len(),
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    let opened = retry_with_backoff(state.config.open_retry, db::is_busy_error, |attempt| {
        if attempt > 1 {
            tracing::info!(attempt, path = %path.display(), "workspace busy, retrying open");
        }
        db::open_db(&path)
    });

    match opened {
        Ok(conn) => {
            // A bad stored override must not prevent the workspace from opening.
            let ttl = match db::settings_get_json(&conn, DASHBOARD_TTL_SETTING) {
                Ok(Some(v)) => v
                    .as_u64()
                    .map(Duration::from_secs)
                    .unwrap_or(state.config.dashboard_ttl),
                Ok(None) => state.config.dashboard_ttl,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring unreadable {}", DASHBOARD_TTL_SETTING);
                    state.config.dashboard_ttl
                }
            };
            state.dashboard_cache = TtlCache::new(ttl);
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            tracing::info!(path = %path.display(), "workspace selected");
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match required_str(req, "key") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::settings_get_json(conn, &key) {
        Ok(value) => ok(&req.id, json!({ "key": key, "value": value })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_settings_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match required_str(req, "key") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(value) = req.params.get("value") else {
        return err(&req.id, "bad_params", "missing value", None);
    };
    if key == DASHBOARD_TTL_SETTING && value.as_u64().is_none() {
        return err(
            &req.id,
            "bad_params",
            format!("{} must be a non-negative integer", DASHBOARD_TTL_SETTING),
            None,
        );
    }
    if let Err(e) = db::settings_set_json(conn, &key, value) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if key == DASHBOARD_TTL_SETTING {
        let secs = value.as_u64().unwrap_or(0);
        state.dashboard_cache = TtlCache::new(Duration::from_secs(secs));
    }
    ok(&req.id, json!({ "key": key, "value": value }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.set" => Some(handle_settings_set(state, req)),
        _ => None,
    }
}
