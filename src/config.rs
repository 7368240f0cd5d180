use crate::retry::RetryPolicy;
use std::time::Duration;

pub const ENV_LOG: &str = "BULLETIND_LOG";
pub const ENV_DASHBOARD_TTL_SECS: &str = "BULLETIND_DASHBOARD_TTL_SECS";
pub const ENV_OPEN_ATTEMPTS: &str = "BULLETIND_OPEN_ATTEMPTS";
pub const ENV_OPEN_BASE_DELAY_MS: &str = "BULLETIND_OPEN_BASE_DELAY_MS";

/// Process-level settings. Workspace-level settings live in the `settings` table.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub log_filter: String,
    pub dashboard_ttl: Duration,
    pub open_retry: RetryPolicy,
    /// Rejected environment values, logged once tracing is up.
    pub warnings: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            dashboard_ttl: Duration::from_secs(60),
            open_retry: RetryPolicy::default(),
            warnings: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let mut warnings = Vec::new();

        let log_filter = match lookup(ENV_LOG)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            Some(raw) => match tracing_subscriber::EnvFilter::try_new(&raw) {
                Ok(_) => raw,
                Err(e) => {
                    warnings.push(format!("ignoring {}={:?}: {}", ENV_LOG, raw, e));
                    defaults.log_filter
                }
            },
            None => defaults.log_filter,
        };

        let dashboard_ttl = parse_u64(&lookup, &mut warnings, ENV_DASHBOARD_TTL_SECS)
            .map(Duration::from_secs)
            .unwrap_or(defaults.dashboard_ttl);

        let max_attempts = parse_u64(&lookup, &mut warnings, ENV_OPEN_ATTEMPTS)
            .filter(|n| *n >= 1)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(defaults.open_retry.max_attempts);

        let base_delay = parse_u64(&lookup, &mut warnings, ENV_OPEN_BASE_DELAY_MS)
            .map(Duration::from_millis)
            .unwrap_or(defaults.open_retry.base_delay);

        Self {
            log_filter,
            dashboard_ttl,
            open_retry: RetryPolicy {
                max_attempts,
                base_delay,
            },
            warnings,
        }
    }
}

fn parse_u64<F>(lookup: &F, warnings: &mut Vec<String>, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(e) => {
            warnings.push(format!("ignoring {}={:?}: {}", key, raw, e));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        assert_eq!(DaemonConfig::from_lookup(|_| None), DaemonConfig::default());
    }

    #[test]
    fn env_values_override_defaults() {
        let cfg = DaemonConfig::from_lookup(lookup_from(&[
            (ENV_LOG, "bulletind=debug"),
            (ENV_DASHBOARD_TTL_SECS, "5"),
            (ENV_OPEN_ATTEMPTS, "7"),
            (ENV_OPEN_BASE_DELAY_MS, "1"),
        ]));
        assert_eq!(cfg.log_filter, "bulletind=debug");
        assert_eq!(cfg.dashboard_ttl, Duration::from_secs(5));
        assert_eq!(cfg.open_retry.max_attempts, 7);
        assert_eq!(cfg.open_retry.base_delay, Duration::from_millis(1));
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = DaemonConfig::from_lookup(lookup_from(&[
            (ENV_DASHBOARD_TTL_SECS, "soon"),
            (ENV_OPEN_ATTEMPTS, "0"),
            (ENV_LOG, "  "),
        ]));
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.dashboard_ttl, Duration::from_secs(60));
        assert_eq!(cfg.open_retry, RetryPolicy::default());
        assert_eq!(cfg.warnings.len(), 1);
        assert!(cfg.warnings[0].contains(ENV_DASHBOARD_TTL_SECS));
    }

    #[test]
    fn unparseable_log_filter_is_reported() {
        let cfg = DaemonConfig::from_lookup(lookup_from(&[(ENV_LOG, "bulletind=loud")]));
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.warnings.len(), 1);
        assert!(cfg.warnings[0].contains(ENV_LOG));
    }
}
