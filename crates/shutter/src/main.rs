mod api;
mod arbiter;
mod config;
mod monitor;
mod motion;
mod sim;
mod state;
mod web;

#[cfg(test)]
mod testkit;

use anyhow::Result;
use std::{env, sync::Arc, time::Duration};
use tracing::{error, info};

use observatory_common::board::{RelayBank, SensorBank};
use observatory_common::events::EventKind;
use observatory_common::store::SqliteStore;

use api::ShutterApi;
use arbiter::ShutterLoop;
use config::Config;
use monitor::{NetworkMonitor, SystemProbe};
use motion::{Shutter, ShutterIo};

#[tokio::main]
async fn main() -> Result<()> {
    observatory_common::init_tracing();

    // ── Env config ──────────────────────────────────────────────────
    let config_path =
        env::var("CONFIG_PATH").unwrap_or_else(|_| "config/shutter.toml".to_string());
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:shutter.db?mode=rwc".to_string());

    let cfg: Config = observatory_common::config::load(&config_path)?;
    info!(path = %config_path, "shutter: config loaded");

    // ── Storage ─────────────────────────────────────────────────────
    let store = SqliteStore::connect(&db_url).await?;
    store.migrate().await?;

    // ── Shutter ─────────────────────────────────────────────────────
    let (relays, inputs) = hardware(&cfg)?;
    let io = ShutterIo::new(relays, inputs, cfg.roles.clone());
    let shutter = Arc::new(Shutter::new(io, Arc::new(store), cfg.motion.clone()));
    shutter.restore().await?;

    // ── Network monitor ─────────────────────────────────────────────
    let probe = Arc::new(SystemProbe::new(&cfg.network));
    let monitor = NetworkMonitor::new(Arc::clone(&shutter), probe, &cfg.network);
    tokio::spawn(monitor.run(Duration::from_millis(cfg.network.period_ms)));

    // ── Web server ──────────────────────────────────────────────────
    let api = ShutterApi::new(
        Arc::clone(&shutter),
        Duration::from_millis(cfg.control.api_lock_ms),
    );
    tokio::spawn(async move {
        if let Err(e) = web::serve(api).await {
            error!("web: {e:#}");
        }
    });

    shutter.events().record(EventKind::System, "shutter started");
    info!("shutter: started, entering control loop");

    // ── Control loop ────────────────────────────────────────────────
    ShutterLoop::new(shutter, cfg.control.clone()).run().await;
    Ok(())
}

type Hardware = (Arc<dyn RelayBank>, Arc<dyn SensorBank>);

#[cfg(feature = "gpio")]
fn hardware(cfg: &Config) -> Result<Hardware> {
    use observatory_common::board::GpioBoard;

    let board = Arc::new(GpioBoard::new(
        &cfg.board.relay_pins(),
        &cfg.board.input_pins(),
        cfg.board.relay_active_low,
        cfg.board.input_active_low,
    )?);
    let relays: Arc<dyn RelayBank> = board.clone();
    let inputs: Arc<dyn SensorBank> = board;
    Ok((relays, inputs))
}

#[cfg(not(feature = "gpio"))]
fn hardware(cfg: &Config) -> Result<Hardware> {
    info!("shutter: no gpio feature, running on simulated board");
    let board = sim::demo_board(
        &cfg.roles,
        cfg.board.relay_gpio.len(),
        cfg.board.input_gpio.len(),
    );
    let mechanics = Arc::new(sim::ShutterSim::new(board.clone(), &cfg.roles, 150));
    tokio::spawn(mechanics.run(Duration::from_millis(100)));
    let relays: Arc<dyn RelayBank> = board.clone();
    let inputs: Arc<dyn SensorBank> = board;
    Ok((relays, inputs))
}
