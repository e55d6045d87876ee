mod config;
mod error;
mod logging;
mod runtime;
pub mod services;

pub use config::{AppConfig, LogFormat};
pub use error::AppError;
pub use runtime::build_context;

fn bootstrap(process: &'static str) -> Result<AppConfig, AppError> {
    let config = AppConfig::from_env()?;
    logging::init(config.log_format)?;

    tracing::info!(
        process,
        db_path = %config.db_path,
        http_bind = %config.http_bind,
        job_interval_secs = config.job_interval_secs,
        max_parallel_requests = config.max_parallel_requests,
        sync_page_size = config.sync_page_size,
        lock_ttl_secs = config.lock_ttl_secs,
        station_gateway_url = %config.station_gateway_url,
        tariff_policy_path = ?config.tariff_policy_path,
        "application bootstrap initialized"
    );

    Ok(config)
}

pub fn run() -> Result<(), AppError> {
    runtime::run(bootstrap("combined")?)
}

pub fn run_api() -> Result<(), AppError> {
    runtime::run_api(bootstrap("api")?)
}

pub fn run_jobs() -> Result<(), AppError> {
    runtime::run_jobs(bootstrap("jobs")?)
}
