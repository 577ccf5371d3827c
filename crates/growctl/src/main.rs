mod alerts;
mod climate;
mod config;
mod control;
mod controller;
mod db;
mod dosing;
mod events;
mod hardware;
mod notify;
mod profile;
mod recovery;
mod relay;
mod reservoir;
mod samplers;
mod scheduler;
mod settings;
mod sim;
mod state;
mod web;

use anyhow::{Context, Result};
use std::env;
use std::path::Path;
use std::sync::Arc;
use time::UtcOffset;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use control::LoopContext;
use controller::Controller;
use db::Db;
use dosing::{CalibrationStore, DosingSequencer};
use events::EventLog;
use hardware::{Actuators, Sensors};
use notify::Notifier;
use profile::ProfileStore;
use recovery::CheckpointStore;
use relay::RelayBoard;
use settings::SettingsStore;
use sim::{Scenario, SimulatedChamber};
use state::{shared, RuntimeStatus};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "growctl.toml".to_string());
    let cfg = config::load(&config_path)?;
    // Read before the runtime starts any threads.
    let utc_offset = cfg.local_offset()?;
    info!(path = %config_path, %utc_offset, fixed = cfg.utc_offset.is_some(), "config loaded");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cfg, utc_offset))
}

async fn run(cfg: config::Config, utc_offset: UtcOffset) -> Result<()> {
    // ── Event store ─────────────────────────────────────────────────
    ensure_db_dir(&cfg.paths.events_db)?;
    let db = Db::connect(&cfg.paths.events_db).await?;
    db.migrate().await?;

    let events = EventLog::new();
    let writer = tokio::spawn(events.clone().run_writer(db.clone()));

    // ── Notifications ───────────────────────────────────────────────
    let notifier = Notifier::new();
    let client = if cfg.mqtt.enabled {
        let (client, eventloop) = notify::connect(&cfg.mqtt);
        tokio::spawn(notify::drive_event_loop(eventloop));
        info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, "mqtt notifications enabled");
        Some(client)
    } else {
        None
    };
    let publisher = tokio::spawn(notifier.clone().run_publisher(client, cfg.mqtt.topic.clone()));

    // ── Settings ────────────────────────────────────────────────────
    let settings = Arc::new(SettingsStore::open(&cfg.paths.settings)?);
    let initial_water_kg = settings.load().reservoir.half_kg;
    let calibration = CalibrationStore::new(&cfg.paths.calibration);
    info!(
        settings = %settings.path().display(),
        calibration = %calibration.path().display(),
        "stores opened"
    );

    // ── Relay board and sensors ─────────────────────────────────────
    let board = RelayBoard::new(&cfg.relays.pins(), cfg.relays.active_low, events.clone())?;
    board.all_off();
    let actuators: Arc<dyn Actuators> = Arc::new(board);

    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let sensors: Arc<dyn Sensors> = Arc::new(SimulatedChamber::new(
        scenario,
        actuators.clone(),
        cfg.scale.clone(),
        initial_water_kg,
    ));
    info!(%scenario, "sensor simulator attached");

    // ── Background samplers ─────────────────────────────────────────
    let status = shared(RuntimeStatus::new());
    status.write().await.record_system("growctl started".to_string());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (scale_tx, scale_rx) = watch::channel(None);
    tokio::spawn(samplers::run_scale_sampler(
        sensors.clone(),
        cfg.scale.clone(),
        settings.clone(),
        scale_tx,
        shutdown_rx.clone(),
    ));
    tokio::spawn(samplers::run_ambient(
        status.clone(),
        sensors.clone(),
        settings.clone(),
        scale_rx.clone(),
        shutdown_rx.clone(),
    ));

    // ── Controller ──────────────────────────────────────────────────
    let dosing = DosingSequencer::new(
        actuators.clone(),
        status.clone(),
        events.clone(),
        calibration,
    );
    let ctx = LoopContext {
        status,
        sensors,
        actuators,
        settings,
        profiles: ProfileStore::new(&cfg.paths.profiles_dir),
        checkpoints: CheckpointStore::new(&cfg.paths.checkpoint),
        events: events.clone(),
        notifier: notifier.clone(),
        scale: scale_rx,
        utc_offset,
    };
    let controller = Arc::new(Controller::new(ctx, dosing));

    if controller.detect_checkpoint().await && cfg.auto_resume {
        if let Err(e) = controller.resume_from_checkpoint().await {
            warn!("auto-resume failed: {e:#}");
        }
    }

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        controller: controller.clone(),
        db,
    };
    let web = tokio::spawn(web::serve(web_state, cfg.web.port, shutdown_rx));

    // ── Run until interrupted ───────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    controller.shutdown().await;
    let _ = shutdown_tx.send(true);
    match web.await {
        Ok(Err(e)) => warn!("web server error: {e:#}"),
        Err(e) => warn!("web server task failed: {e}"),
        Ok(Ok(())) => {}
    }

    events.close();
    notifier.close();
    let _ = writer.await;
    let _ = publisher.await;
    info!("growctl stopped");
    Ok(())
}

/// Make sure the directory holding a file-backed sqlite database exists.
fn ensure_db_dir(url: &str) -> Result<()> {
    let path = url
        .trim_start_matches("sqlite:")
        .trim_start_matches("//")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() || path.starts_with(':') {
        return Ok(());
    }
    if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }
    Ok(())
}
