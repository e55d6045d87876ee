use std::time::Duration;

use crate::app::AppError;
use crate::roaming::SyncSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: String,
    pub http_bind: String,
    pub job_interval_secs: u64,
    pub max_parallel_requests: usize,
    pub sync_page_size: u32,
    pub lock_ttl_secs: u64,
    pub station_gateway_url: String,
    pub tariff_policy_path: Option<String>,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        if let Err(error) = dotenvy::dotenv()
            && !error.not_found()
        {
            return Err(AppError::config(format!("unreadable .env file: {error}")));
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let station_gateway_url = non_empty(&lookup, "STATION_GATEWAY_URL")
            .ok_or_else(|| AppError::config("STATION_GATEWAY_URL is required"))?;

        let log_format = match non_empty(&lookup, "LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(AppError::config(format!(
                    "LOG_FORMAT must be text or json, got {other}"
                )));
            }
        };

        let max_parallel_requests = parse_or_default(&lookup, "MAX_PARALLEL_REQUESTS", 5_usize)?;
        if max_parallel_requests == 0 {
            return Err(AppError::config("MAX_PARALLEL_REQUESTS must be at least 1"));
        }
        let sync_page_size = parse_or_default(&lookup, "SYNC_PAGE_SIZE", 100_u32)?;
        if sync_page_size == 0 {
            return Err(AppError::config("SYNC_PAGE_SIZE must be at least 1"));
        }

        Ok(Self {
            db_path: non_empty(&lookup, "DB_PATH")
                .unwrap_or_else(|| "/var/lib/roaming/roaming.db".to_string()),
            http_bind: non_empty(&lookup, "HTTP_BIND")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            job_interval_secs: parse_or_default(&lookup, "JOB_INTERVAL_SECS", 900_u64)?,
            max_parallel_requests,
            sync_page_size,
            lock_ttl_secs: parse_or_default(&lookup, "LOCK_TTL_SECS", 600_u64)?,
            station_gateway_url,
            tariff_policy_path: non_empty(&lookup, "TARIFF_POLICY_PATH"),
            log_format,
        })
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            max_parallel_requests: self.max_parallel_requests,
            page_size: self.sync_page_size,
            lock_ttl_secs: self.lock_ttl_secs,
        }
    }

    pub fn job_interval(&self) -> Duration {
        Duration::from_secs(self.job_interval_secs.max(1))
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(default),
    }
}
