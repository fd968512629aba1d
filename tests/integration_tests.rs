use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;

use vacbus::channel::StateSnapshot;
use vacbus::config::default_config;
use vacbus::error::ActionError;
use vacbus::firmware::{MockBoard, MockConnector};
use vacbus::gas::NullGas;
use vacbus::link::{DeviceLink, LinkSettings};
use vacbus::procedure::{OrchestratorSettings, RunStatus};
use vacbus::rules::EnforcementMode;
use vacbus::supervisor::{EmergencyEvent, Supervisor};

fn fast_settings() -> LinkSettings {
    LinkSettings {
        sensor_poll: Duration::from_millis(20),
        relay_poll: Duration::from_millis(30),
        command_timeout: Duration::from_millis(200),
        inter_command_delay: Duration::from_millis(1),
        reconnect_backoff: Duration::from_millis(20),
    }
}

struct Rig {
    board: MockBoard,
    link: DeviceLink,
    supervisor: Supervisor,
    emergencies: mpsc::Receiver<EmergencyEvent>,
}

async fn rig() -> Rig {
    let cfg = default_config().unwrap();
    let board = MockBoard::new(&cfg);
    let link = DeviceLink::spawn(MockConnector::new(board.clone()), &cfg, fast_settings());
    let (supervisor, emergencies) = Supervisor::new(
        &cfg,
        link.clone(),
        Arc::new(NullGas),
        OrchestratorSettings {
            condition_poll: Duration::from_millis(10),
        },
    );
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !link.is_connected() {
        assert!(tokio::time::Instant::now() < deadline, "link never connected");
        sleep(Duration::from_millis(5)).await;
    }
    Rig {
        board,
        link,
        supervisor,
        emergencies,
    }
}

async fn wait_snap<F>(link: &DeviceLink, what: &str, pred: F)
where
    F: Fn(&StateSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !pred(&link.current_snapshot()) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {}",
            what
        );
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_normal_mode_blocks_unlisted_manual_toggle() {
    let rig = rig().await;

    let err = rig
        .supervisor
        .manual_set_relay("turbo_pump", true, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ActionError::Blocked(_)));
    assert!(!rig.board.relay_commanded("turbo_pump"));

    // Allow-listed relay goes straight through.
    rig.supervisor
        .manual_set_relay("vent_valve_loadlock", true, false)
        .await
        .unwrap();
    assert!(rig.board.relay_commanded("vent_valve_loadlock"));
}

#[tokio::test]
async fn test_mode_changes_enforce_role_levels() {
    let rig = rig().await;
    assert_eq!(rig.supervisor.mode(), EnforcementMode::Normal);

    assert!(rig.supervisor.set_mode(EnforcementMode::Manual, 0).is_err());
    rig.supervisor.set_mode(EnforcementMode::Manual, 1).unwrap();
    assert_eq!(rig.supervisor.mode(), EnforcementMode::Manual);

    assert!(rig.supervisor.set_mode(EnforcementMode::Override, 1).is_err());
    rig.supervisor.set_mode(EnforcementMode::Override, 2).unwrap();
    assert_eq!(rig.supervisor.mode(), EnforcementMode::Override);
}

#[tokio::test]
async fn test_manual_confirmation_roundtrip() {
    let rig = rig().await;
    rig.supervisor.set_mode(EnforcementMode::Manual, 1).unwrap();

    let err = rig
        .supervisor
        .manual_set_relay("sputter_power", true, false)
        .await
        .unwrap_err();
    match err {
        ActionError::ConfirmationRequired(reason) => {
            assert!(reason.contains("confirm"));
        }
        other => panic!("expected confirmation demand, got {:?}", other),
    }
    assert!(!rig.board.relay_commanded("sputter_power"));

    rig.supervisor
        .manual_set_relay("sputter_power", true, true)
        .await
        .unwrap();
    assert!(rig.board.relay_commanded("sputter_power"));
}

#[tokio::test]
async fn test_unknown_relay_role_is_reported() {
    let rig = rig().await;
    let err = rig
        .supervisor
        .manual_set_relay("heater", true, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ActionError::UnknownRelay(_)));
}

#[tokio::test]
async fn test_detected_state_tracks_the_plant() {
    let rig = rig().await;

    rig.board.set_analog_volts("chamber_pressure", 4.8);
    wait_snap(&rig.link, "vented", |s| {
        s.analog("chamber_pressure").map_or(false, |a| a.volts() > 4.5)
    })
    .await;
    assert_eq!(rig.supervisor.detected_state(), "vented");

    rig.board.set_analog_volts("chamber_pressure", 1.5);
    wait_snap(&rig.link, "rough vacuum", |s| {
        s.analog("chamber_pressure").map_or(false, |a| a.volts() < 2.0)
    })
    .await;
    assert_eq!(rig.supervisor.detected_state(), "rough_vacuum");
}

#[tokio::test]
async fn test_emergency_cancels_runs_and_reaches_the_console() {
    let mut rig = rig().await;
    rig.supervisor.set_mode(EnforcementMode::Manual, 1).unwrap();

    // A run parked on a long wait, and mains powered with interlocks good.
    rig.board.set_analog_volts("chamber_pressure", 4.8);
    wait_snap(&rig.link, "vented", |s| {
        s.analog("chamber_pressure").map_or(false, |a| a.volts() > 4.5)
    })
    .await;
    let mut run = rig.supervisor.start_procedure("pump_down").unwrap();
    rig.supervisor
        .manual_set_relay("mains_power", true, false)
        .await
        .unwrap();

    // Cooling water drops out.
    rig.board.set_input_safe("water_flow", false);

    let event = tokio::time::timeout(Duration::from_secs(3), rig.emergencies.recv())
        .await
        .expect("no emergency within deadline")
        .expect("emergency channel closed");
    assert!(event.message.contains("cooling water"));

    assert_eq!(run.wait().await, RunStatus::Cancelled);
    assert!(rig.supervisor.active_runs().is_empty());
}

#[tokio::test]
async fn test_sputter_run_grants_gas_valves_for_its_duration() {
    let rig = rig().await;

    // Gas valves are not operator-controllable in Normal mode on their own.
    let err = rig
        .supervisor
        .manual_set_relay("gas_valve_n2", true, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ActionError::Blocked(_)));

    let mut run = rig.supervisor.start_procedure("sputter_entry").unwrap();

    // The run parks on the sputter power confirmation; its grants are live.
    sleep(Duration::from_millis(1300)).await;
    assert_eq!(run.status(), RunStatus::Running);
    rig.supervisor
        .manual_set_relay("gas_valve_n2", true, false)
        .await
        .unwrap();
    assert!(rig.board.relay_commanded("gas_valve_n2"));

    assert!(rig.supervisor.confirm_procedure("sputter_entry"));
    assert_eq!(run.wait().await, RunStatus::Completed);
    assert!(rig.board.relay_commanded("sputter_power"));

    // Grants die with the run.
    let err = rig
        .supervisor
        .manual_set_relay("gas_valve_n2", false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ActionError::Blocked(_)));
}

#[tokio::test]
async fn test_status_report_serializes() {
    let rig = rig().await;
    let report = rig.supervisor.status_report();
    assert!(report.connected);

    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"connected\":true"));
    assert!(json.contains("mains_power"));
}

#[tokio::test]
async fn test_all_off_is_always_available() {
    let rig = rig().await;
    rig.supervisor
        .manual_set_relay("vent_valve_loadlock", true, false)
        .await
        .unwrap();

    rig.supervisor.all_off().await.unwrap();
    assert!(!rig.board.relay_commanded("vent_valve_loadlock"));
}
