// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

mod config;
mod controller_task;
mod gateway;
mod weather;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use obs_app::{init_logging, normalize_name, ConfigFile};
use obs_backend::{register_builtin_backends_on, DeviceAccess, RegistrationContext, SimulatorSettings};
use obs_core::controller::{
    AdaptivePolling, ControllerConfig, Devices, ExponentialBackoff, ObservationStateMachine,
    ObservatoryController, TargetRetryPolicy, TransitionTable,
};
use obs_core::message::SafetyStatus;
use obs_core::sky::VisibilityCalculator;
use obs_core::{
    Catalog, DynResult, ObsMessage, PointingConfig, SchedulerKind, SiteContext, TargetScheduler,
};
use obs_protocol::{GatewayEvent, NoAuthValidator, TokenSetValidator, TokenValidator};

use config::ServerConfig;
use controller_task::{run_controller_task, GatewayBridge};
use gateway::GatewayContext;

const PKG_DESCRIPTION: &str = concat!(env!("CARGO_PKG_NAME"), " - observatory control daemon");
const INBOX_CHANNEL_BUFFER: usize = 64;
const EVENT_CHANNEL_BUFFER: usize = 256;
const RETRY_MAX_DELAY_SECS: u64 = 2;

#[derive(Debug, Parser)]
#[command(
    author = env!("CARGO_PKG_AUTHORS"),
    version = env!("CARGO_PKG_VERSION"),
    about = PKG_DESCRIPTION,
)]
struct Cli {
    /// Path to configuration file
    #[arg(long = "config", short = 'C', value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print example configuration and exit
    #[arg(long = "print-config")]
    print_config: bool,
    /// Mount driver to use (overrides [mount].driver)
    #[arg(long = "mount")]
    mount: Option<String>,
    /// Camera driver to use (overrides [camera].driver)
    #[arg(long = "camera")]
    camera: Option<String>,
    /// Target catalog (overrides [scheduler].catalog)
    #[arg(long = "catalog", value_name = "FILE")]
    catalog: Option<PathBuf>,
    /// IP address for the messaging gateway
    #[arg(short = 'l', long = "listen")]
    listen: Option<IpAddr>,
    /// Port for the messaging gateway
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,
    /// Exit once the run ends parked instead of waiting for a resume
    #[arg(long = "once")]
    once: bool,
}

fn device_access(port: &Option<String>, model: &Option<String>) -> DeviceAccess {
    DeviceAccess {
        port: port.clone(),
        model: model.clone(),
    }
}

fn simulator_settings(cfg: &ServerConfig) -> SimulatorSettings {
    SimulatorSettings {
        bias_ra_deg: cfg.mount.sim_bias_ra_deg,
        bias_dec_deg: cfg.mount.sim_bias_dec_deg,
        slew_rate_deg_per_sec: cfg.mount.sim_slew_rate_deg_per_sec,
        time_scale: cfg.mount.sim_time_scale,
    }
}

fn site_context(cfg: &ServerConfig) -> SiteContext {
    SiteContext {
        latitude_deg: cfg.site.latitude,
        longitude_deg: cfg.site.longitude,
        elevation_m: cfg.site.elevation_m,
        horizon_deg: cfg.site.horizon_deg,
        twilight_horizon_deg: cfg.site.twilight_horizon_deg,
        utc_offset_hours: cfg.site.utc_offset_hours,
    }
}

fn build_controller_config(cfg: &ServerConfig, once: bool, weather_safe: bool) -> ControllerConfig {
    let solve_timeout =
        (cfg.solver.timeout_secs > 0).then(|| Duration::from_secs(cfg.solver.timeout_secs));
    ControllerConfig {
        pointing: PointingConfig {
            threshold_deg: cfg.pointing.threshold,
            exptime_secs: cfg.pointing.exptime,
            max_iterations: cfg.pointing.max_iterations,
            solve_timeout,
        },
        retry: ExponentialBackoff::new(
            cfg.behavior.max_retries.max(1),
            Duration::from_millis(cfg.behavior.retry_base_delay_ms),
            Duration::from_secs(RETRY_MAX_DELAY_SECS),
        ),
        safety_grace: Duration::from_secs(cfg.state_machine.safety_grace_secs),
        checkpoint_interval: Duration::from_millis(cfg.state_machine.checkpoint_interval_ms),
        idle_retry: Duration::from_secs(cfg.scheduler.idle_retry_secs),
        auto_start: true,
        exit_when_done: once,
        initial_safety: SafetyStatus {
            weather_safe,
            horizon_safe: true,
        },
    }
}

#[tokio::main]
async fn main() -> DynResult<()> {
    let cli = Cli::parse();

    if cli.print_config {
        println!("{}", ServerConfig::example_toml());
        return Ok(());
    }

    let (mut cfg, config_path) = if let Some(ref path) = cli.config {
        let cfg = ServerConfig::load_from_file(path)?;
        (cfg, Some(path.clone()))
    } else {
        ServerConfig::load_from_default_paths()?
    };
    if let Some(ref mount) = cli.mount {
        cfg.mount.driver = mount.clone();
    }
    if let Some(ref camera) = cli.camera {
        cfg.camera.driver = camera.clone();
    }
    if let Some(ref catalog) = cli.catalog {
        cfg.scheduler.catalog = catalog.clone();
    }
    cfg.validate()
        .map_err(|e| format!("Invalid server configuration: {}", e))?;

    init_logging(cfg.general.log_level.as_deref());

    if let Some(ref path) = config_path {
        info!("Loaded configuration from {}", path.display());
    }

    let mut registry = RegistrationContext::new();
    register_builtin_backends_on(&mut registry, simulator_settings(&cfg));

    let table = TransitionTable::by_name(&cfg.state_machine.table)?;
    table.validate()?;
    let kind: SchedulerKind = cfg.scheduler.scheduler_type.parse()?;
    let catalog = Catalog::load_from_file(&cfg.scheduler.catalog).map_err(|e| {
        format!(
            "Failed to load catalog {}: {}",
            cfg.scheduler.catalog.display(),
            e
        )
    })?;
    info!(
        "Loaded {} targets from {}",
        catalog.len(),
        cfg.scheduler.catalog.display()
    );

    let mount = registry
        .mounts
        .build(&cfg.mount.driver, &device_access(&cfg.mount.port, &cfg.mount.model))?;
    let camera = registry
        .cameras
        .build(&cfg.camera.driver, &device_access(&cfg.camera.port, &cfg.camera.model))?;
    let solver = registry
        .solvers
        .build(&cfg.solver.driver, &DeviceAccess::default())?;
    let mut weather = if cfg.weather.driver.trim().is_empty() {
        None
    } else {
        Some(
            registry
                .weather
                .build(&cfg.weather.driver, &device_access(&cfg.weather.port, &None))?,
        )
    };

    info!(
        "Starting obs-server (observatory: {}, mount: {}, camera: {}, solver: {}, weather: {})",
        cfg.general.name.as_deref().unwrap_or("unnamed"),
        normalize_name(&cfg.mount.driver),
        normalize_name(&cfg.camera.driver),
        normalize_name(&cfg.solver.driver),
        if weather.is_some() {
            normalize_name(&cfg.weather.driver)
        } else {
            "disabled".to_string()
        }
    );

    let weather_safe = match weather.as_mut() {
        Some(monitor) => weather::poll_once(monitor.as_mut()).await,
        None => true,
    };
    if !weather_safe {
        warn!("Weather is unsafe at startup; waiting before the run starts");
    }

    let (inbox_tx, inbox_rx) = mpsc::channel::<ObsMessage>(INBOX_CHANNEL_BUFFER);
    let (events_tx, _) = broadcast::channel::<GatewayEvent>(EVENT_CHANNEL_BUFFER);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut task_handles: Vec<JoinHandle<()>> = Vec::new();

    let scheduler = TargetScheduler::new(
        kind,
        VisibilityCalculator::new(site_context(&cfg)),
        catalog,
        TargetRetryPolicy::new(
            Duration::from_secs(cfg.scheduler.exhausted_cooldown_secs),
            cfg.scheduler.max_target_failures,
        ),
    );
    let mut controller = ObservatoryController::new(
        ObservationStateMachine::new(table),
        scheduler,
        Devices {
            mount,
            camera,
            solver,
        },
        inbox_rx,
        build_controller_config(&cfg, cli.once, weather_safe),
    );
    let (snapshot_tx, snapshot_rx) = watch::channel(controller.snapshot());
    controller.register_listener(Arc::new(GatewayBridge::new(
        events_tx.clone(),
        snapshot_tx,
    )));

    if cfg.messaging.enabled {
        let listen_ip = cli.listen.unwrap_or(cfg.messaging.listen);
        let listen_port = cli.port.unwrap_or(cfg.messaging.port);
        let listen_addr = SocketAddr::from((listen_ip, listen_port));
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| format!("Failed to bind gateway on {}: {}", listen_addr, e))?;
        let validator: Arc<dyn TokenValidator> = if cfg.messaging.auth.tokens.is_empty() {
            Arc::new(NoAuthValidator)
        } else {
            Arc::new(TokenSetValidator::new(cfg.messaging.auth.tokens.clone()))
        };
        let ctx = GatewayContext {
            inbox_tx: inbox_tx.clone(),
            events_tx: events_tx.clone(),
            snapshot_rx,
            validator,
        };
        task_handles.push(tokio::spawn(async move {
            if let Err(e) = gateway::run_gateway(listener, ctx).await {
                error!("Gateway error: {:?}", e);
            }
        }));
    } else {
        info!("Messaging gateway disabled");
    }

    if let Some(monitor) = weather {
        let polling = AdaptivePolling::new(
            Duration::from_millis(cfg.weather.poll_interval_ms),
            Duration::from_millis(cfg.weather.unsafe_poll_interval_ms),
        );
        task_handles.push(tokio::spawn(weather::run_weather_monitor(
            monitor,
            Box::new(polling),
            weather_safe,
            inbox_tx.clone(),
            shutdown_rx.clone(),
        )));
    }

    let mut controller_handle = tokio::spawn(async move {
        if let Err(e) = run_controller_task(controller).await {
            error!("Controller error: {}", e);
        }
    });

    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("Ctrl+C received, parking before shutdown");
            if inbox_tx.send(ObsMessage::Shutdown).await.is_err() {
                warn!("Controller already stopped");
            }
            if let Err(e) = (&mut controller_handle).await {
                error!("Controller task failed: {:?}", e);
            }
        }
        res = &mut controller_handle => {
            if let Err(e) = res {
                error!("Controller task failed: {:?}", e);
            }
        }
    }

    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_millis(400)).await;

    for handle in &task_handles {
        handle.abort();
    }
    for handle in task_handles {
        let _ = handle.await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "obs-server",
            "--mount",
            "simulator",
            "--catalog",
            "/tmp/targets.toml",
            "-p",
            "7000",
            "--once",
        ]);
        assert_eq!(cli.mount.as_deref(), Some("simulator"));
        assert_eq!(cli.catalog, Some(PathBuf::from("/tmp/targets.toml")));
        assert_eq!(cli.port, Some(7000));
        assert!(cli.once);
        assert!(!cli.print_config);
    }

    #[test]
    fn test_controller_config_from_server_config() {
        let mut cfg = ServerConfig::default();
        cfg.solver.timeout_secs = 0;
        cfg.pointing.threshold = 0.02;
        let controller = build_controller_config(&cfg, true, false);
        assert_eq!(controller.pointing.threshold_deg, 0.02);
        assert_eq!(controller.pointing.solve_timeout, None);
        assert_eq!(controller.safety_grace, Duration::from_secs(900));
        assert!(controller.exit_when_done);
        assert!(!controller.initial_safety.weather_safe);
        assert!(controller.initial_safety.horizon_safe);
    }

    #[test]
    fn test_site_context_from_server_config() {
        let mut cfg = ServerConfig::default();
        cfg.site.latitude = -30.24;
        cfg.site.horizon_deg = 20.0;
        let site = site_context(&cfg);
        assert_eq!(site.latitude_deg, -30.24);
        assert_eq!(site.horizon_deg, 20.0);
        assert_eq!(site.twilight_horizon_deg, -18.0);
    }
}
