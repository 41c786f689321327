//! Worker configuration

use thiserror::Error;

/// Every ten minutes, on the minute
pub const DEFAULT_TRIAL_RECONCILE_CRON: &str = "0 */10 * * * *";
/// Daily at 04:00 UTC
pub const DEFAULT_INVARIANT_CHECK_CRON: &str = "0 0 4 * * *";
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    /// Six-field cron expression (seconds first)
    pub trial_reconcile_cron: String,
    pub invariant_check_cron: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let db_max_connections = match get("DB_MAX_CONNECTIONS") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::Invalid {
                    name: "DB_MAX_CONNECTIONS",
                    value: raw,
                })?,
            None => DEFAULT_DB_MAX_CONNECTIONS,
        };

        let trial_reconcile_cron = cron_var(&get, "TRIAL_RECONCILE_CRON", DEFAULT_TRIAL_RECONCILE_CRON)?;
        let invariant_check_cron = cron_var(&get, "INVARIANT_CHECK_CRON", DEFAULT_INVARIANT_CHECK_CRON)?;

        Ok(Self {
            database_url,
            db_max_connections,
            trial_reconcile_cron,
            invariant_check_cron,
        })
    }
}

/// Cron expressions must carry a seconds field (six or seven fields)
fn cron_var<F>(get: &F, name: &'static str, default: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => {
            let fields = raw.split_whitespace().count();
            if (6..=7).contains(&fields) {
                Ok(raw.trim().to_string())
            } else {
                Err(ConfigError::Invalid { name, value: raw })
            }
        }
        None => Ok(default.to_string()),
    }
}
