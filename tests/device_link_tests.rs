use std::time::Duration;

use tokio::time::sleep;

use vacbus::channel::StateSnapshot;
use vacbus::config::{default_config, SystemConfig};
use vacbus::error::LinkError;
use vacbus::firmware::{MockBoard, MockConnector};
use vacbus::link::{BoardCommand, DeviceLink, LinkSettings};

fn fast_settings() -> LinkSettings {
    LinkSettings {
        sensor_poll: Duration::from_millis(20),
        relay_poll: Duration::from_millis(30),
        command_timeout: Duration::from_millis(200),
        inter_command_delay: Duration::from_millis(1),
        reconnect_backoff: Duration::from_millis(20),
    }
}

fn rig() -> (SystemConfig, MockBoard, DeviceLink) {
    let cfg = default_config().unwrap();
    let board = MockBoard::new(&cfg);
    let link = DeviceLink::spawn(MockConnector::new(board.clone()), &cfg, fast_settings());
    (cfg, board, link)
}

async fn wait_until<F>(link: &DeviceLink, what: &str, pred: F)
where
    F: Fn(&StateSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if pred(&link.current_snapshot()) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {}", what);
        }
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_link_connects_and_polls_sensors() {
    let (_cfg, board, link) = rig();
    board.set_analog_volts("chamber_pressure", 4.8);

    wait_until(&link, "connect", |s| s.connected).await;
    wait_until(&link, "sensor poll", |s| {
        s.digital("water_flow").map_or(false, |d| d.safe)
            && s.analog("chamber_pressure").map_or(false, |a| a.volts() > 4.5)
    })
    .await;
}

#[tokio::test]
async fn test_set_relay_updates_commanded_then_echo_confirms() {
    let (_cfg, board, link) = rig();
    wait_until(&link, "connect", |s| s.connected).await;

    link.set_relay("rough_pump", true).await.unwrap();
    assert!(board.relay_commanded("rough_pump"));

    let snap = link.current_snapshot();
    assert!(snap.relay("rough_pump").unwrap().commanded);

    wait_until(&link, "relay echo", |s| {
        s.relay("rough_pump").map_or(false, |r| r.confirmed)
    })
    .await;
}

#[tokio::test]
async fn test_commands_run_in_submission_order() {
    let (_cfg, board, link) = rig();
    wait_until(&link, "connect", |s| s.connected).await;

    // Queued strictly in order, one exchange at a time on the wire.
    let (a, b, c) = tokio::join!(
        link.set_relay("rough_pump", true),
        link.set_relay("rough_pump", false),
        link.set_relay("rough_pump", true),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    let sets: Vec<String> = board
        .write_log()
        .into_iter()
        .filter(|l| l.starts_with("SET 2 "))
        .collect();
    assert_eq!(sets, vec!["SET 2 1", "SET 2 0", "SET 2 1"]);

    assert!(board.relay_commanded("rough_pump"));
    assert!(link.current_snapshot().relay("rough_pump").unwrap().commanded);
}

#[tokio::test]
async fn test_unknown_relay_id_is_rejected_not_fatal() {
    let (_cfg, _board, link) = rig();
    wait_until(&link, "connect", |s| s.connected).await;

    let err = link
        .send(BoardCommand::SetRelay { id: 99, on: true })
        .await
        .unwrap_err();
    assert_eq!(err, LinkError::Rejected);

    // The link survives the rejection.
    link.set_relay("rough_pump", true).await.unwrap();
}

#[tokio::test]
async fn test_disconnect_fails_fast_then_reconnects() {
    let (_cfg, board, link) = rig();
    wait_until(&link, "connect", |s| s.connected).await;

    board.set_online(false);
    wait_until(&link, "drop detection", |s| !s.connected).await;

    // While down, commands fail without waiting out a timeout.
    let started = std::time::Instant::now();
    let err = link.set_relay("rough_pump", true).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(150));
    assert!(format!("{}", err).contains("disconnected"));

    board.set_online(true);
    wait_until(&link, "reconnect", |s| s.connected).await;
    link.set_relay("rough_pump", true).await.unwrap();
}

#[tokio::test]
async fn test_command_traffic_does_not_starve_reconnection() {
    let (_cfg, board, link) = rig();
    wait_until(&link, "connect", |s| s.connected).await;

    board.set_online(false);
    wait_until(&link, "drop detection", |s| !s.connected).await;

    // Hammer the queue faster than the backoff interval. The backoff timer
    // must keep running through the fast-failed commands.
    let spam_link = link.clone();
    let spam = tokio::spawn(async move {
        loop {
            let _ = spam_link.set_relay("rough_pump", true).await;
            sleep(Duration::from_millis(5)).await;
        }
    });

    sleep(Duration::from_millis(100)).await;
    board.set_online(true);
    wait_until(&link, "reconnect under command pressure", |s| s.connected).await;
    spam.abort();
}

#[tokio::test]
async fn test_park_check_halt_blocks_connection() {
    let cfg = default_config().unwrap();
    let board = MockBoard::new(&cfg);
    board.set_input_safe("rod_home", false);
    let link = DeviceLink::spawn(MockConnector::new(board.clone()), &cfg, fast_settings());

    sleep(Duration::from_millis(200)).await;
    assert!(!link.is_connected());

    // Parking the rod clears the halt on the next boot attempt.
    board.set_input_safe("rod_home", true);
    wait_until(&link, "connect after unpark", |s| s.connected).await;
}

#[tokio::test]
async fn test_board_interlock_overrides_commanded_mains() {
    let (_cfg, board, link) = rig();
    wait_until(&link, "connect", |s| s.connected).await;

    // No rule engine in this path: the link writes whatever it is told.
    board.set_input_safe("door_closed", false);
    link.set_relay("mains_power", true).await.unwrap();

    assert!(board.relay_commanded("mains_power"));
    assert!(!board.relay_effective("mains_power"));

    // The echo makes the divergence visible in the snapshot.
    sleep(Duration::from_millis(100)).await;
    let snap = link.current_snapshot();
    let mains = snap.relay("mains_power").unwrap();
    assert!(mains.commanded);
    assert!(!mains.confirmed);
}

#[tokio::test]
async fn test_all_off_clears_commanded_relays() {
    let (board_cfg, board, link) = rig();
    wait_until(&link, "connect", |s| s.connected).await;

    link.set_relay("rough_pump", true).await.unwrap();
    link.set_relay("turbo_pump", true).await.unwrap();
    link.all_off().await.unwrap();

    for relay in &board_cfg.relays {
        assert!(!board.relay_commanded(&relay.role), "{} still on", relay.role);
    }
    let snap = link.current_snapshot();
    assert!(snap.relays.iter().all(|r| !r.commanded));
}

#[tokio::test]
async fn test_digital_polarity_is_normalized_in_snapshot() {
    let (_cfg, board, link) = rig();
    wait_until(&link, "connect", |s| s.connected).await;
    wait_until(&link, "initial digital poll", |s| {
        s.digital("water_flow").map_or(false, |d| d.safe)
    })
    .await;

    board.set_input_safe("water_flow", false);
    wait_until(&link, "unsafe water flow", |s| {
        s.digital("water_flow").map_or(true, |d| !d.safe)
    })
    .await;
}
