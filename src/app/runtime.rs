use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use actix_web::{App, HttpServer, web};

use crate::adapters::api::{ApiState, configure_routes};
use crate::adapters::db::{open_connection, run_migrations};
use crate::adapters::station_commands::HttpStationCommandClient;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::services::SqliteRoamingStore;
use crate::domain::policy::PolicyTable;
use crate::roaming::RoamingContext;
use crate::roaming::jobs::JobScheduler;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub fn build_context(config: &AppConfig) -> Result<RoamingContext, AppError> {
    let mut connection = open_connection(&config.db_path).map_err(AppError::database_init)?;
    run_migrations(&mut connection).map_err(AppError::database_init)?;
    let store = SqliteRoamingStore::new(Arc::new(Mutex::new(connection)));

    let stations =
        HttpStationCommandClient::new(&config.station_gateway_url).map_err(AppError::runtime)?;
    let mut ctx = RoamingContext::new(store, Arc::new(stations), config.sync_settings());

    if let Some(path) = &config.tariff_policy_path {
        let policies = PolicyTable::from_file(path).map_err(AppError::policy)?;
        tracing::info!(path = %path, "tariff policies loaded");
        ctx = ctx.with_policies(policies);
    }

    Ok(ctx)
}

async fn serve(state: ApiState, bind: &str) -> std::io::Result<()> {
    tracing::info!(bind = %bind, "http server starting");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(configure_routes)
    })
    .bind(bind)?
    .run()
    .await
}

pub fn run(config: AppConfig) -> Result<(), AppError> {
    let ctx = build_context(&config)?;
    let scheduler = JobScheduler::new(ctx.clone());
    let api_state = ApiState::new(ctx);
    let stop_flag = Arc::new(AtomicBool::new(false));
    let interval = config.job_interval();

    actix_web::rt::System::new().block_on(async move {
        let mut jobs = actix_web::rt::spawn({
            let stop_flag = Arc::clone(&stop_flag);
            async move { scheduler.run_forever(interval, stop_flag).await }
        });

        let server_result = serve(api_state, &config.http_bind).await;

        stop_flag.store(true, Ordering::Relaxed);
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut jobs).await.is_err() {
            tracing::warn!("job scheduler did not stop in time, aborting");
            jobs.abort();
        }

        server_result.map_err(AppError::runtime)
    })
}

pub fn run_api(config: AppConfig) -> Result<(), AppError> {
    let api_state = ApiState::new(build_context(&config)?);

    actix_web::rt::System::new()
        .block_on(serve(api_state, &config.http_bind))
        .map_err(AppError::runtime)
}

pub fn run_jobs(config: AppConfig) -> Result<(), AppError> {
    let scheduler = JobScheduler::new(build_context(&config)?);
    let stop_flag = Arc::new(AtomicBool::new(false));
    let interval = config.job_interval();

    tracing::info!(interval_secs = interval.as_secs(), "job scheduler starting");

    actix_web::rt::System::new().block_on(async move {
        tokio::select! {
            () = scheduler.run_forever(interval, Arc::clone(&stop_flag)) => Ok(()),
            signal = actix_web::rt::signal::ctrl_c() => {
                stop_flag.store(true, Ordering::Relaxed);
                tracing::info!("shutdown requested");
                signal.map_err(AppError::runtime)
            }
        }
    })
}
