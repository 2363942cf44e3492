//! End-to-end capture sequencing against the mock transport
//!
//! The sorter runs on its own task with the Tokio clock paused, so settle waits and
//! poll intervals advance deterministically.

use std::sync::Arc;
use std::time::Duration;

use drill_sorter::app::{ConsoleCommand, SorterApp};
use drill_sorter::classify::LookupTable;
use drill_sorter::config::{DeviceConfig, SorterConfig};
use drill_sorter::transport::{ConnectionId, MockTransport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CALIPER: ConnectionId = ConnectionId::new(1);
const ROBOT: ConnectionId = ConnectionId::new(2);

fn drill_table() -> LookupTable {
    LookupTable::from_json_str(include_str!("../config/inchdrill.json")).unwrap()
}

fn config() -> SorterConfig {
    SorterConfig {
        caliper: DeviceConfig {
            path: "/dev/caliper".to_string(),
            baud_rate: 115_200,
        },
        robot: DeviceConfig {
            path: "/dev/robot".to_string(),
            baud_rate: 38_400,
        },
        ..SorterConfig::default()
    }
}

async fn start(
    transport: &Arc<MockTransport>,
) -> (mpsc::UnboundedSender<ConsoleCommand>, JoinHandle<SorterApp>) {
    let mut app = SorterApp::new(&config(), transport.clone(), Arc::new(drill_table()));
    app.connect().await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        app.run(rx).await.unwrap();
        app
    });
    (tx, handle)
}

/// Let the sorter drain everything injected so far.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn caliper_reads(transport: &MockTransport, readings: &[&str]) {
    for reading in readings {
        transport.inject_bytes(CALIPER, format!("{reading}\n").as_bytes());
    }
    settle().await;
}

async fn robot_requests(transport: &MockTransport) {
    transport.inject_bytes(ROBOT, b"%m\n");
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_capture_waits_for_caliper_to_settle() {
    let transport = Arc::new(MockTransport::new());
    let (tx, handle) = start(&transport).await;

    caliper_reads(&transport, &["100", "200"]).await;
    robot_requests(&transport).await;

    // Still moving: nothing sent yet
    assert!(transport.sent(ROBOT).is_empty());

    caliper_reads(&transport, &["201"]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(transport.sent_text(ROBOT), vec!["%01\n"]);

    tx.send(ConsoleCommand::Quit).unwrap();
    let app = handle.await.unwrap();
    let entry = app.captures().get("5/64").unwrap();
    assert_eq!((entry.index, entry.hits), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn test_cups_are_assigned_in_order_of_first_sight() {
    let transport = Arc::new(MockTransport::new());
    let (tx, handle) = start(&transport).await;

    caliper_reads(&transport, &["199", "199"]).await;
    robot_requests(&transport).await;

    caliper_reads(&transport, &["500", "500"]).await;
    robot_requests(&transport).await;

    caliper_reads(&transport, &["198", "198"]).await;
    robot_requests(&transport).await;

    assert_eq!(transport.sent_text(ROBOT), vec!["%01\n", "%02\n", "%01\n"]);

    drop(tx);
    let app = handle.await.unwrap();
    let labels: Vec<&str> = app
        .captures()
        .entries()
        .iter()
        .map(|entry| entry.label.as_str())
        .collect();
    assert_eq!(labels, vec!["5/64", "13/64"]);
    assert_eq!(app.captures().get("5/64").unwrap().hits, 2);
}

#[tokio::test(start_paused = true)]
async fn test_unsettled_caliper_still_captures_after_budget() {
    let transport = Arc::new(MockTransport::new());
    let (tx, handle) = start(&transport).await;

    caliper_reads(&transport, &["100", "200"]).await;
    robot_requests(&transport).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(transport.sent(ROBOT).is_empty());

    // 21 evaluations, 100 ms apart
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(transport.sent_text(ROBOT), vec!["%01\n"]);

    tx.send(ConsoleCommand::Quit).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sentinel_during_wait_is_ignored() {
    let transport = Arc::new(MockTransport::new());
    let (tx, handle) = start(&transport).await;

    caliper_reads(&transport, &["100", "200"]).await;
    robot_requests(&transport).await;
    robot_requests(&transport).await;

    caliper_reads(&transport, &["201"]).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.sent_text(ROBOT), vec!["%01\n"]);

    // The next request after completion is served normally
    robot_requests(&transport).await;
    assert_eq!(transport.sent_text(ROBOT), vec!["%01\n", "%01\n"]);

    tx.send(ConsoleCommand::Quit).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_request_without_reading_sends_nothing() {
    let transport = Arc::new(MockTransport::new());
    let (tx, handle) = start(&transport).await;

    robot_requests(&transport).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(transport.sent(ROBOT).is_empty());

    caliper_reads(&transport, &["318", "318"]).await;
    robot_requests(&transport).await;
    assert_eq!(transport.sent_text(ROBOT), vec!["%01\n"]);

    tx.send(ConsoleCommand::Quit).unwrap();
    let app = handle.await.unwrap();
    assert!(app.captures().get("1/8").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_sentinel_split_across_chunks() {
    let transport = Arc::new(MockTransport::new());
    let (tx, handle) = start(&transport).await;

    caliper_reads(&transport, &["238", "238"]).await;
    transport.inject_bytes(ROBOT, b"%");
    settle().await;
    assert!(transport.sent(ROBOT).is_empty());

    transport.inject_bytes(ROBOT, b"m\r\n");
    settle().await;
    assert_eq!(transport.sent_text(ROBOT), vec!["%01\n"]);

    tx.send(ConsoleCommand::Quit).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_console_commands_reach_running_app() {
    let transport = Arc::new(MockTransport::new());
    let (tx, handle) = start(&transport).await;

    caliper_reads(&transport, &["150"]).await;
    tx.send(ConsoleCommand::Zero(1.0)).unwrap();
    settle().await;

    // Offset of -50 maps the same position to 1.00 mm
    caliper_reads(&transport, &["150", "150"]).await;
    robot_requests(&transport).await;
    tx.send(ConsoleCommand::Clear).unwrap();
    settle().await;

    tx.send(ConsoleCommand::Quit).unwrap();
    let app = handle.await.unwrap();

    assert_eq!(app.measurement().lock().current(), Some(100));
    assert_eq!(transport.sent_text(ROBOT), vec!["%01\n"]);
    assert!(app.captures().is_empty());
    assert!(!transport.is_open(CALIPER));
    assert!(!transport.is_open(ROBOT));
}
