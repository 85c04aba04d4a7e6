//! Supervisor integration tests
//!
//! Drives the full control loop against fake devices

mod common;

use tokio::sync::watch;

use common::*;
use solarbridge::console::INIT_BAUD_RATE;
use solarbridge::devices::DeviceKind;
use solarbridge::sink::CsvSink;
use solarbridge::control::SupportState;
use solarbridge::error::ConfigError;
use solarbridge::supervisor::{
    BatteryHandle, DeviceHandle, Supervisor, SupervisorError, SupervisorState,
};
use solarbridge::telemetry::TelemetryRecord;

fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

#[tokio::test]
async fn test_connect_writes_cutout_and_hysteresis_once() {
    let config = test_config();
    let mut rig = rig(&config, &[80; 6]);

    rig.supervisor.connect().await.unwrap();

    assert_eq!(rig.supervisor.state(), SupervisorState::Running);
    assert_eq!(rig.inverter.writes_to(LOW_BATTERY_CUT_OUT), vec![vec![45500, 0]]);
    assert_eq!(rig.inverter.writes_to(BATTERY_HYSTERESIS), vec![vec![2000, 0]]);
    assert_eq!(rig.battery.state().opened_at[0], INIT_BAUD_RATE);
    assert_eq!(rig.battery.handshakes(), 1);
}

#[tokio::test]
async fn test_end_to_end_single_transition() {
    let config = test_config();
    let mut rig = rig(&config, &[82, 81, 80, 79, 78, 77]);
    let (_tx, rx) = no_shutdown();

    rig.supervisor.connect().await.unwrap();

    // mean 79.5 sits inside the 40..80 band
    let report = rig.supervisor.tick(&rx).await.unwrap();
    let control = report.control.unwrap();
    assert_eq!(control.state, SupportState::Disabled);
    assert_eq!(control.writes, 0);
    assert_eq!(report.battery.unwrap().average_soc, 80);

    rig.battery.set_socs(&[85, 84, 83, 82, 81, 80]);
    let report = rig.supervisor.tick(&rx).await.unwrap();
    let control = report.control.unwrap();
    assert_eq!(control.state, SupportState::Enabled);
    assert!(control.transitioned);
    assert_eq!(control.writes, 1);

    assert_eq!(rig.inverter.writes_to(GRID_SUPPORT), vec![vec![1]]);
    assert_eq!(rig.supervisor.control_state().support, SupportState::Enabled);
}

#[tokio::test]
async fn test_charge_controller_failure_is_isolated() {
    let config = test_config();
    let mut rig = rig(&config, &[90; 6]);
    let (_tx, rx) = no_shutdown();

    rig.supervisor.connect().await.unwrap();
    rig.charge_controller.set_failing(true);

    let report = rig.supervisor.tick(&rx).await.unwrap();

    assert!(report.battery.is_some());
    assert_eq!(report.snapshots.len(), 1);
    assert_eq!(report.snapshots[0].device_id, "xw");
    assert_eq!(report.failed, vec!["mppt-1".to_string()]);
    assert_eq!(report.control.unwrap().writes, 1);
    assert_eq!(rig.sink.device_ids(), vec!["battery", "xw"]);

    assert_eq!(rig.supervisor.retry_count("mppt-1"), Some(1));
    assert_eq!(rig.supervisor.retry_count("xw"), Some(0));
    assert_eq!(rig.supervisor.retry_count("battery"), Some(0));
}

#[tokio::test]
async fn test_battery_failure_skips_control_only() {
    let mut config = test_config();
    config.battery.retry.reconnect_after = 1;
    let mut rig = rig(&config, &[90; 6]);
    let (_tx, rx) = no_shutdown();

    rig.supervisor.connect().await.unwrap();
    rig.battery.state().fail_reads = true;

    let report = rig.supervisor.tick(&rx).await.unwrap();
    assert!(report.battery.is_none());
    assert!(report.control.is_none());
    assert_eq!(report.snapshots.len(), 2);
    assert_eq!(rig.supervisor.retry_count("battery"), Some(1));

    // the console stays faulted until the soft threshold re-runs the handshake
    rig.battery.state().fail_reads = false;
    let report = rig.supervisor.tick(&rx).await.unwrap();
    assert!(report.battery.is_none());
    assert_eq!(rig.battery.handshakes(), 2);

    let report = rig.supervisor.tick(&rx).await.unwrap();
    assert!(report.battery.is_some());
    assert!(report.control.is_some());
    assert_eq!(rig.supervisor.retry_count("battery"), Some(0));
}

#[tokio::test]
async fn test_soft_threshold_reconnects() {
    let mut config = test_config();
    set_retry(&mut config.charge_controllers[0], 1, 5);
    let mut rig = rig(&config, &[60; 6]);
    let (_tx, rx) = no_shutdown();

    rig.supervisor.connect().await.unwrap();
    rig.charge_controller.set_failing(true);

    rig.supervisor.tick(&rx).await.unwrap();
    assert_eq!(rig.charge_controller.state().reconnects, 0);

    rig.supervisor.tick(&rx).await.unwrap();
    assert_eq!(rig.charge_controller.state().reconnects, 1);

    rig.charge_controller.set_failing(false);
    let report = rig.supervisor.tick(&rx).await.unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(rig.supervisor.retry_count("mppt-1"), Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_hard_threshold_aborts_and_restores() {
    let mut config = test_config();
    set_retry(&mut config.charge_controllers[0], 1, 2);
    let mut rig = rig(&config, &[90; 6]);
    rig.charge_controller.state().fail_after = Some(0);
    let (_tx, rx) = no_shutdown();

    let err = rig.supervisor.run(rx).await.unwrap_err();

    match err {
        SupervisorError::RetryBudgetExhausted {
            device,
            failures,
            threshold,
        } => {
            assert_eq!(device, "mppt-1");
            assert_eq!(failures, 3);
            assert_eq!(threshold, 2);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(rig.supervisor.state(), SupervisorState::Faulted);
    assert_eq!(rig.charge_controller.state().reconnects, 1);

    // support was enabled at 90%, then forced off on the way out
    assert_eq!(rig.inverter.writes_to(GRID_SUPPORT).last(), Some(&vec![0]));
    assert_eq!(
        rig.inverter.writes_to(BATTERY_HYSTERESIS).last(),
        Some(&vec![2500, 0])
    );
    assert_eq!(
        rig.inverter.writes_to(LOW_BATTERY_CUT_OUT).last(),
        Some(&vec![46500, 0])
    );
    assert!(rig.battery.state().closed);
    assert!(rig.inverter.state().closed);
    assert!(rig.charge_controller.state().closed);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_restores_safe_defaults() {
    let config = test_config();
    let mut rig = rig(&config, &[50; 6]);
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    rig.supervisor.run(rx).await.unwrap();

    assert_eq!(rig.supervisor.state(), SupervisorState::Stopped);
    assert_eq!(
        rig.inverter.writes_to(LOW_BATTERY_CUT_OUT),
        vec![vec![45500, 0], vec![46500, 0]]
    );
    assert_eq!(rig.inverter.writes_to(GRID_SUPPORT), vec![vec![0]]);
    assert!(rig.inverter.state().closed);
}

#[tokio::test(start_paused = true)]
async fn test_startup_forces_one_rehandshake_then_aborts() {
    let config = test_config();
    let mut rig = rig(&config, &[50; 6]);
    rig.battery.state().silent = true;
    let (_tx, rx) = no_shutdown();

    let err = rig.supervisor.run(rx).await.unwrap_err();

    assert!(matches!(
        err,
        SupervisorError::Startup { ref device, .. } if device == "battery"
    ));
    assert_eq!(rig.battery.handshakes(), 2);
    // the inverter was never opened, so nothing was written before the restore
    assert_eq!(rig.inverter.writes_to(LOW_BATTERY_CUT_OUT), vec![vec![46500, 0]]);
    assert_eq!(rig.supervisor.state(), SupervisorState::Faulted);
}

#[tokio::test]
async fn test_shutdown_is_observed_between_devices() {
    let config = test_config();
    let mut rig = rig(&config, &[50; 6]);
    let (tx, rx) = watch::channel(false);

    rig.supervisor.connect().await.unwrap();
    let reads_before = rig.inverter.state().reads;

    tx.send(true).unwrap();
    let report = rig.supervisor.tick(&rx).await.unwrap();

    assert!(report.cancelled);
    assert!(report.battery.is_some());
    assert_eq!(rig.inverter.state().reads, reads_before);
}

#[tokio::test]
async fn test_subscribers_receive_records_in_poll_order() {
    let config = test_config();
    let mut rig = rig(&config, &[70; 6]);
    let mut records = rig.supervisor.subscribe();
    let (_tx, rx) = no_shutdown();

    rig.supervisor.connect().await.unwrap();
    rig.supervisor.tick(&rx).await.unwrap();

    match records.try_recv().unwrap() {
        TelemetryRecord::Battery(b) => {
            assert_eq!(b.modules.len(), 6);
            assert_eq!(b.summary.average_soc, 70);
        }
        other => panic!("expected battery record, got {:?}", other),
    }
    assert_eq!(records.try_recv().unwrap().device_id(), "xw");
    assert_eq!(records.try_recv().unwrap().device_id(), "mppt-1");
    assert!(records.try_recv().is_err());
}

#[tokio::test]
async fn test_invalid_thresholds_fail_before_io() {
    let mut config = test_config();
    config.control.soc_low = 80;
    config.control.soc_high = 80;

    let battery = FakeConsole::with_socs(&[50; 6]);
    let inverter = FakeDevice::new();
    let result = Supervisor::new(
        &config,
        BatteryHandle::new(&config.battery, Box::new(battery.clone())),
        DeviceHandle::new(
            &config.inverter,
            DeviceKind::Inverter,
            Box::new(inverter.clone()),
        ),
        vec![],
    );

    assert!(matches!(
        result,
        Err(ConfigError::ThresholdOrder { low: 80, high: 80 })
    ));
    assert!(battery.state().written.is_empty());
    assert!(inverter.state().writes.is_empty());
}

#[tokio::test]
async fn test_sink_failure_does_not_stop_the_loop() {
    let config = test_config();
    let rig = rig(&config, &[90; 6]);
    let mut supervisor = rig.supervisor.with_sink(Box::new(FailingSink));
    let mut records = supervisor.subscribe();
    let (_tx, rx) = no_shutdown();

    supervisor.connect().await.unwrap();
    let report = supervisor.tick(&rx).await.unwrap();

    assert!(report.failed.is_empty());
    assert_eq!(report.control.unwrap().state, SupportState::Enabled);
    assert_eq!(records.try_recv().unwrap().device_id(), "battery");
}

#[tokio::test]
async fn test_control_write_failures_exhaust_inverter_budget() {
    let mut config = test_config();
    set_retry(&mut config.inverter, 1, 2);
    let mut rig = rig(&config, &[90; 6]);
    let (_tx, rx) = no_shutdown();

    rig.supervisor.connect().await.unwrap();
    rig.inverter.state().fail_writes = true;

    // telemetry reads keep working, only the support write is rejected
    let report = rig.supervisor.tick(&rx).await.unwrap();
    assert_eq!(report.snapshots[0].device_id, "xw");
    assert_eq!(report.failed, vec!["xw".to_string()]);
    assert_eq!(rig.supervisor.retry_count("xw"), Some(1));

    rig.supervisor.tick(&rx).await.unwrap();
    assert_eq!(rig.supervisor.retry_count("xw"), Some(2));
    assert_eq!(rig.inverter.state().reconnects, 1);

    match rig.supervisor.tick(&rx).await.unwrap_err() {
        SupervisorError::RetryBudgetExhausted {
            device,
            failures,
            threshold,
        } => {
            assert_eq!(device, "xw");
            assert_eq!(failures, 3);
            assert_eq!(threshold, 2);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_inverter_count_clears_once_control_succeeds() {
    let mut config = test_config();
    set_retry(&mut config.inverter, 1, 5);
    let mut rig = rig(&config, &[90; 6]);
    let (_tx, rx) = no_shutdown();

    rig.supervisor.connect().await.unwrap();
    rig.inverter.state().fail_writes = true;
    rig.supervisor.tick(&rx).await.unwrap();
    assert_eq!(rig.supervisor.retry_count("xw"), Some(1));

    rig.inverter.state().fail_writes = false;
    let report = rig.supervisor.tick(&rx).await.unwrap();
    assert_eq!(report.control.unwrap().writes, 1);
    assert_eq!(rig.supervisor.retry_count("xw"), Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_limits_and_safe_defaults_written_with_control_disabled() {
    let mut config = test_config();
    config.control.enabled = false;
    let mut rig = rig(&config, &[90; 6]);
    let (tx, rx) = watch::channel(false);

    rig.supervisor.connect().await.unwrap();
    assert_eq!(rig.inverter.writes_to(LOW_BATTERY_CUT_OUT), vec![vec![45500, 0]]);
    assert_eq!(rig.inverter.writes_to(BATTERY_HYSTERESIS), vec![vec![2000, 0]]);

    let report = rig.supervisor.tick(&rx).await.unwrap();
    assert!(report.control.is_none());
    assert!(rig.inverter.writes_to(GRID_SUPPORT).is_empty());

    tx.send(true).unwrap();
    rig.supervisor.run(rx).await.unwrap();

    assert_eq!(
        rig.inverter.writes_to(LOW_BATTERY_CUT_OUT).last(),
        Some(&vec![46500, 0])
    );
    assert_eq!(
        rig.inverter.writes_to(BATTERY_HYSTERESIS).last(),
        Some(&vec![2500, 0])
    );
    assert_eq!(rig.inverter.writes_to(GRID_SUPPORT), vec![vec![0]]);
}

#[tokio::test]
async fn test_combox_polled_after_charge_controllers() {
    let mut config = test_config();
    let mut combox_config = config.charge_controllers[0].clone();
    combox_config.id = "combox".to_string();
    combox_config.unit_id = 201;
    config.combox = Some(combox_config.clone());

    let combox = FakeDevice::new();
    let mut supervisor = Supervisor::new(
        &config,
        BatteryHandle::new(&config.battery, Box::new(FakeConsole::with_socs(&[60; 6]))),
        DeviceHandle::new(&config.inverter, DeviceKind::Inverter, Box::new(FakeDevice::new())),
        vec![
            DeviceHandle::new(
                &config.charge_controllers[0],
                DeviceKind::ChargeController,
                Box::new(FakeDevice::new()),
            ),
            DeviceHandle::new(&combox_config, DeviceKind::ComBox, Box::new(combox.clone())),
        ],
    )
    .unwrap();
    let (_tx, rx) = no_shutdown();

    supervisor.connect().await.unwrap();
    let report = supervisor.tick(&rx).await.unwrap();

    let kinds: Vec<DeviceKind> = report.snapshots.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![DeviceKind::Inverter, DeviceKind::ChargeController, DeviceKind::ComBox]
    );
    assert_eq!(report.snapshots[2].device_id, "combox");
    assert_eq!(combox.state().reads, 1);
}

#[tokio::test]
async fn test_csv_sink_written_from_control_loop() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config();
    let rig = rig(&config, &[70; 6]);
    let mut supervisor = rig
        .supervisor
        .with_sink(Box::new(CsvSink::new(dir.path()).unwrap()));
    let (_tx, rx) = no_shutdown();

    supervisor.connect().await.unwrap();
    supervisor.tick(&rx).await.unwrap();

    let mut files: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(files.len(), 3);
    assert!(files[0].ends_with("_battery.csv"));
    assert!(files[1].ends_with("_mppt-1.csv"));
    assert!(files[2].ends_with("_xw.csv"));

    let battery = std::fs::read_to_string(dir.path().join(&files[0])).unwrap();
    // header plus one row per module
    assert_eq!(battery.lines().count(), 7);
}
