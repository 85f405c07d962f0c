//! `coilsweep` – minefield coverage tracker.
//!
//! 1. Loads `~/.coilsweep/config.toml` (or `--config`), then applies
//!    `COILSWEEP_*` environment overrides.
//! 2. Builds the coverage grid; invalid grid parameters abort startup.
//! 3. Starts the WebSocket bridge: external transform broadcasters feed coil
//!    poses in, coverage output streams out.
//! 4. In simulation mode, starts the built-in vehicle and waits for the start
//!    handshake on the event bus.
//! 5. Runs the coverage loop until **Ctrl-C** (or `--max-cycles`).

mod config;
mod sim;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use clap::Parser;
use colored::Colorize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use coilsweep_middleware::{Bridge, EventBus, Topic};
use coilsweep_perception::{CoverageGrid, DetectionFootprint, PoseSampler, TfEngine, TfPoseSource};
use coilsweep_runtime::{
    BusPublisher, CoverageLoop, CoverageLoopConfig, StartGate, spawn_bus_listener, start_gate,
    spawn_transform_listener,
};
use coilsweep_types::{EventPayload, SweepError};

use crate::config::Config;
use crate::sim::VehicleSim;

/// Track which cells of a minefield the detector coils have swept.
#[derive(Debug, Parser)]
#[command(name = "coilsweep", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Drive the built-in simulated vehicle (implies the start handshake).
    #[arg(long)]
    simulate: bool,

    /// Stop after this many cycles.
    #[arg(long, value_name = "N")]
    max_cycles: Option<u64>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = coilsweep_runtime::init_tracing("coilsweep");

    print_banner();

    let path = cli.config.clone().unwrap_or_else(config::config_path);
    let mut cfg = match config::load_from(&path) {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Ok(None) => {
            let cfg = Config::default();
            match config::save_to(&cfg, &path) {
                Ok(()) => println!(
                    "  No config found; defaults written to {}",
                    path.display().to_string().bold()
                ),
                Err(e) => {
                    warn!(error = %e, "could not write default config");
                    println!(
                        "  No config at {}; using defaults.",
                        path.display().to_string().dimmed()
                    );
                }
            }
            cfg
        }
        Err(e) => {
            error!(error = %e, "configuration rejected");
            println!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };
    config::apply_env_overrides(&mut cfg);
    if cli.simulate {
        cfg.is_simulation = true;
    }

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_for_ctrlc = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping coverage loop …".yellow().bold());
        shutdown_for_ctrlc.store(true, Ordering::Release);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; stop the process externally");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg, cli.max_cycles, shutdown)) {
        Ok(summary) => {
            println!(
                "\n  {} {} cycles, {:.1}% of the field covered.\n",
                "✓".green().bold(),
                summary.cycles,
                summary.coverage_ratio * 100.0
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "coilsweep aborted");
            println!("{}: {}", "Error".red(), e);
            ExitCode::FAILURE
        }
    }
}

struct RunSummary {
    cycles: u64,
    coverage_ratio: f64,
}

async fn run(
    cfg: Config,
    max_cycles: Option<u64>,
    shutdown: Arc<AtomicBool>,
) -> Result<RunSummary, SweepError> {
    let grid = CoverageGrid::new(cfg.resolution, cfg.num_cells_in_x, cfg.num_cells_in_y)?;
    let footprint = DetectionFootprint::new(cfg.detection_min_dist, cfg.resolution)?;

    let bus = EventBus::default();
    let tf = Arc::new(RwLock::new(TfEngine::new()));

    let sampler = PoseSampler::new(
        cfg.reference_frame.clone(),
        cfg.coil_frames.iter().cloned(),
        Box::new(TfPoseSource::new(Arc::clone(&tf), cfg.stale_after())),
    )?
    .with_failure_backoff(cfg.failure_backoff())
    .with_stale_warn_cycles(cfg.stale_warn_cycles);

    let mut driver = CoverageLoop::new(
        grid,
        sampler,
        footprint,
        Box::new(BusPublisher::new(bus.clone())),
        CoverageLoopConfig {
            rate_hz: cfg.rate_hz,
            clearance: cfg.clearance,
            frame_id: cfg.reference_frame.clone(),
        },
    )?;

    if cfg.bridge_enabled {
        let listener = Bridge::bind(cfg.bridge_socket_addr()?).await?;
        tokio::spawn(Bridge::new(bus.clone()).serve(listener));
    }

    let mut gate = if cfg.is_simulation {
        let (trigger, gate) = start_gate();
        spawn_bus_listener(&bus, trigger);
        gate
    } else {
        StartGate::opened()
    };

    let sim = if cfg.is_simulation {
        let field_x = f64::from(driver.grid().width()) * driver.grid().resolution();
        let field_y = f64::from(driver.grid().height()) * driver.grid().resolution();
        let vehicle = VehicleSim::new(
            Arc::clone(&tf),
            cfg.reference_frame.clone(),
            &cfg.coil_frames,
            field_x,
            field_y,
        );
        Some(vehicle.spawn(bus.clone(), Arc::clone(&shutdown), cfg.rate_hz))
    } else {
        spawn_transform_listener(&bus, Arc::clone(&tf));
        if cfg.bridge_enabled {
            info!(addr = %cfg.bridge_addr, "waiting for coil transforms on the bridge");
        } else {
            warn!("simulation and bridge both disabled; coil poses will stay unavailable");
        }
        None
    };

    info!("waiting to start");
    gate.wait(cfg.start_timeout()).await?;
    info!("start gate open");

    spawn_rate_reporter(&bus, cfg.rate_hz);

    let cycles = driver.run(Arc::clone(&shutdown), max_cycles).await;

    shutdown.store(true, Ordering::Release);
    if let Some(handle) = sim
        && let Err(e) = handle.await
    {
        warn!(error = %e, "simulator task ended abnormally");
    }

    Ok(RunSummary {
        cycles,
        coverage_ratio: driver.grid().coverage_ratio(),
    })
}

/// Print the published coverage rate roughly once every five seconds.
fn spawn_rate_reporter(bus: &EventBus, rate_hz: f64) {
    let every = ((rate_hz * 5.0) as u64).max(1);
    let mut rx = bus.subscribe_to(Topic::CoverageRate);
    tokio::spawn(async move {
        let mut seen: u64 = 0;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let EventPayload::CoverageRate(rate) = event.payload {
                        seen += 1;
                        if seen % every == 0 {
                            println!("  coverage {:>6.2}%", f64::from(rate) * 100.0);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

fn print_banner() {
    println!();
    println!("  {} {}", "coilsweep".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Minefield coverage tracker");
    println!();
}
