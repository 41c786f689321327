//! Server configuration loaded from the environment

use std::env;

use thiserror::Error;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// HS256 secret Supabase signs access tokens with
    pub supabase_jwt_secret: String,
    pub bind_address: String,
    pub allowed_origins: Vec<String>,
    pub db_max_connections: u32,
    /// Apply embedded migrations at startup
    pub run_migrations: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("DATABASE_URL")?;
        let supabase_jwt_secret = required("SUPABASE_JWT_SECRET")?;

        let bind_address =
            env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let db_max_connections = match env::var("DB_MAX_CONNECTIONS") {
            Ok(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::Invalid {
                    name: "DB_MAX_CONNECTIONS",
                    value: raw,
                })?,
            Err(_) => DEFAULT_DB_MAX_CONNECTIONS,
        };

        let run_migrations = match env::var("RUN_MIGRATIONS") {
            Ok(raw) => parse_bool(&raw).ok_or(ConfigError::Invalid {
                name: "RUN_MIGRATIONS",
                value: raw,
            })?,
            Err(_) => true,
        };

        Ok(Self {
            database_url,
            supabase_jwt_secret,
            bind_address,
            allowed_origins,
            db_max_connections,
            run_migrations,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
