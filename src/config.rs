use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub credentials_dir: String,
    pub fcm_api_url: String,
    pub fcm_send_concurrency: usize,
    pub scheduler_interval: Duration,
    pub dispatch_timeout: Duration,
    pub api_bind_address: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 5)?,
            credentials_dir: env::var("CREDENTIALS_DIR")
                .unwrap_or_else(|_| "./credentials".to_string()),
            fcm_api_url: env::var("FCM_API_URL")
                .unwrap_or_else(|_| "https://fcm.googleapis.com".to_string()),
            fcm_send_concurrency: parse_or("FCM_SEND_CONCURRENCY", 16)?,
            scheduler_interval: Duration::from_secs(parse_or("SCHEDULER_INTERVAL_SECS", 60)?),
            dispatch_timeout: Duration::from_secs(parse_or("DISPATCH_TIMEOUT_SECS", 30)?),
            api_bind_address: env::var("API_BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        })
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number, got {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}
