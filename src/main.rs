//! SolarBridge - Battery-aware inverter controller
//!
//! Pylontech console + Conext Modbus TCP control loop

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use solarbridge::config::{self, Config};
use solarbridge::metrics;
use solarbridge::mqtt::MqttPublisher;
use solarbridge::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    print_banner();

    info!("Starting SolarBridge v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = config::load_config()?;
    config.validate().context("Invalid configuration")?;
    log_configuration(&config);

    if config.metrics.enabled {
        metrics::init_metrics(&config.metrics.listen)?;
    }

    let mut supervisor =
        Supervisor::from_config(&config).context("Failed to set up devices")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let publisher = if config.mqtt.enabled {
        let publisher = MqttPublisher::new(&config.mqtt)
            .await
            .context("Failed to start MQTT publisher")?;
        Some(tokio::spawn(
            publisher.run(supervisor.subscribe(), shutdown_rx.clone()),
        ))
    } else {
        None
    };

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => warn!("Cannot listen for interrupt: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    let result = supervisor.run(shutdown_rx).await;

    // closes the telemetry channel
    drop(supervisor);
    if let Some(task) = publisher {
        let _ = task.await;
    }

    result.context("Control loop aborted")?;
    info!("SolarBridge stopped");
    Ok(())
}

fn log_configuration(config: &Config) {
    let control = &config.control;
    info!(
        "Battery: {} module(s) on {}",
        config.battery.module_count, config.battery.port
    );
    info!(
        "Inverter: {}:{} (unit {}), {} charge controller(s)",
        config.inverter.host,
        config.inverter.port,
        config.inverter.unit_id,
        config.charge_controllers.len()
    );
    if let Some(combox) = &config.combox {
        info!("ComBox: {}:{} (unit {})", combox.host, combox.port, combox.unit_id);
    }
    info!(
        "Cadence {}s, support ON at {}%, OFF at {}% ({:?})",
        control.cadence_secs, control.soc_high, control.soc_low, control.support_register
    );
    info!(
        "Battery low {} V, hysteresis {} V",
        control.battery_low_cutout, control.battery_hysteresis
    );
    info!(
        "Display: {}, data log: {}, inverter control: {}",
        control.display, control.persist, control.enabled
    );
}

fn print_banner() {
    println!(
        r#"
    ╔═══════════════════════════════════════════════════════════════╗
    ║                                                               ║
    ║   ███████╗ ██████╗ ██╗      █████╗ ██████╗                    ║
    ║   ██╔════╝██╔═══██╗██║     ██╔══██╗██╔══██╗                   ║
    ║   ███████╗██║   ██║██║     ███████║██████╔╝                   ║
    ║   ╚════██║██║   ██║██║     ██╔══██║██╔══██╗                   ║
    ║   ███████║╚██████╔╝███████╗██║  ██║██║  ██║  BRIDGE           ║
    ║   ╚══════╝ ╚═════╝ ╚══════╝╚═╝  ╚═╝╚═╝  ╚═╝                   ║
    ║                                                               ║
    ║   Battery-aware Inverter Control                              ║
    ║   Pylontech Console + Conext Modbus TCP                       ║
    ║                                                               ║
    ╚═══════════════════════════════════════════════════════════════╝
    "#
    );
}
