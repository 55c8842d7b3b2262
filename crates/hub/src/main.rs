mod catalog;
mod config;
mod db;
mod dispatch;
mod error;
mod hub;
mod reconcile;
mod registry;
mod scheduler;
mod state;
mod sweeper;
mod web;
mod wire;

use anyhow::Result;
use std::env;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use hub::Hub;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:plant-monitor.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    info!(db_url = %db_url, "db ready");

    // ── Config file ─────────────────────────────────────────────────
    let cfg = config::load_or_default(&config_path)?;
    let dispatcher = dispatch::from_config(&cfg.dispatcher);

    // ── Hub ─────────────────────────────────────────────────────────
    let mut hub = Hub::load(db, dispatcher, cfg.hub_options()).await;
    config::apply(&cfg, &mut hub);
    let (handle, hub_task) = hub.spawn();

    // ── Web server ──────────────────────────────────────────────────
    tokio::select! {
        res = web::serve(handle.clone(), web_port) => {
            if let Err(e) = res {
                error!("web server stopped: {e:#}");
            }
        }
        res = tokio::signal::ctrl_c() => {
            match res {
                Ok(()) => info!("shutdown requested"),
                Err(e) => warn!("failed to listen for ctrl-c: {e}"),
            }
        }
    }

    handle.shutdown().await;
    if let Err(e) = hub_task.await {
        error!("hub task ended abnormally: {e}");
    }
    info!("plant monitor hub stopped");
    Ok(())
}
