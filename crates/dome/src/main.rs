mod api;
mod arbiter;
mod config;
mod encoder;
mod monitor;
mod motion;
mod sim;
mod site;
mod state;
mod web;

#[cfg(test)]
mod testkit;

use anyhow::Result;
use std::{env, sync::Arc, time::Duration};
use tracing::{error, info};

use observatory_common::board::{RelayBank, SensorBank};
use observatory_common::store::SqliteStore;

use api::DomeApi;
use arbiter::ControlLoop;
use config::Config;
use encoder::{BusTiming, Encoder, SerialBus};
use monitor::PowerMonitor;
use motion::{Dome, DomeIo};
use site::HttpSiteHooks;

#[tokio::main]
async fn main() -> Result<()> {
    observatory_common::init_tracing();

    // ── Env config ──────────────────────────────────────────────────
    let config_path =
        env::var("CONFIG_PATH").unwrap_or_else(|_| "config/dome.toml".to_string());
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:dome.db?mode=rwc".to_string());

    let cfg: Config = observatory_common::config::load(&config_path)?;
    info!(path = %config_path, "dome: config loaded");

    // ── Storage ─────────────────────────────────────────────────────
    let store = SqliteStore::connect(&db_url).await?;
    store.migrate().await?;

    // ── Board and encoder bus ───────────────────────────────────────
    let (relays, inputs, bus) = hardware(&cfg)?;
    let encoder = Encoder::new(bus, BusTiming::from(&cfg.encoder));

    // ── Dome ────────────────────────────────────────────────────────
    let io = DomeIo::new(relays, inputs, cfg.roles.clone());
    let dome = Arc::new(Dome::new(
        io,
        encoder,
        Arc::new(store),
        cfg.motion.clone(),
    ));
    dome.restore().await?;
    dome.sync_encoder(Duration::from_millis(cfg.encoder.startup_retry_ms))
        .await;

    let hooks = Arc::new(HttpSiteHooks::new(&cfg.site)?);
    let period = Duration::from_millis(cfg.control.loop_period_ms);

    // ── Power monitor ───────────────────────────────────────────────
    let monitor = PowerMonitor::new(Arc::clone(&dome), hooks.clone(), cfg.power.trip_cycles);
    tokio::spawn(monitor.run(period));

    // ── Web server ──────────────────────────────────────────────────
    let api = DomeApi::new(
        Arc::clone(&dome),
        Duration::from_millis(cfg.control.api_lock_ms),
    );
    tokio::spawn(async move {
        if let Err(e) = web::serve(api).await {
            error!("web: {e:#}");
        }
    });

    dome.events()
        .record(observatory_common::events::EventKind::System, "dome started");
    info!("dome: started, entering control loop");

    // ── Control loop ────────────────────────────────────────────────
    ControlLoop::new(dome, hooks, cfg.control.clone()).run().await;
    Ok(())
}

type Hardware = (Arc<dyn RelayBank>, Arc<dyn SensorBank>, Box<dyn SerialBus>);

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
    let bus: Box<dyn SerialBus> = Box::new(encoder::UartBus::open(&cfg.encoder)?);
    Ok((relays, inputs, bus))
}

#[cfg(not(feature = "gpio"))]
fn hardware(cfg: &Config) -> Result<Hardware> {
    info!("dome: no gpio feature, running on simulated board and encoder");
    let board = sim::demo_board(
        &cfg.roles,
        cfg.board.relay_gpio.len(),
        cfg.board.input_gpio.len(),
    );
    let bus: Box<dyn SerialBus> = Box::new(sim::SimEncoder::new(
        board.clone(),
        &cfg.roles,
        cfg.motion.park_azimuth,
    ));
    let relays: Arc<dyn RelayBank> = board.clone();
    let inputs: Arc<dyn SensorBank> = board;
    Ok((relays, inputs, bus))
}
