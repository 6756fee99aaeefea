use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::bridge::BridgeClient;
use crate::cli::{Args, Config};
use crate::db::Db;
use crate::scheduler::Scheduler;
use crate::server::AppState;

mod bridge;
mod chain;
mod cli;
mod db;
mod errors;
mod genesis;
mod scheduler;
mod server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::init(args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(config.log_level.into())
                .from_env_lossy(),
        )
        .init();

    let db = Db::connect(&config.db).await?;
    db.init_schema().await.context("schema bootstrap failed")?;

    let bridge = BridgeClient::new(
        &config.bridge_url,
        &config.network.name,
        Duration::from_secs(config.bridge_timeout_seconds),
    )?;

    genesis::load_if_needed(&db, &bridge, &config.network).await?;

    let scheduler = Scheduler::new(
        db.clone(),
        bridge.clone(),
        config.scheduler.clone(),
        config.network.start_time,
    );
    let sync = tokio::spawn(scheduler.start());

    let state = Arc::new(AppState {
        db,
        bridge,
        network_magic: config.network.network_magic,
    });
    let app = server::router(state);
    let listener =
        tokio::net::TcpListener::bind((config.server_address.as_str(), config.server_port))
            .await
            .with_context(|| {
                format!(
                    "cannot bind {}:{}",
                    config.server_address, config.server_port
                )
            })?;
    info!(
        "server is listening on {}:{}",
        config.server_address, config.server_port
    );

    tokio::select! {
        served = axum::serve(listener, app).into_future() => served.context("http server failed")?,
        synced = sync => synced.context("sync task panicked")??,
    }
    Ok(())
}
