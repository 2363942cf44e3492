//! Integration tests for SerialConnection over a shared transport
//!
//! Two connections share one MockTransport the way the caliper and robot do, so every
//! event reaches both inboxes and each connection must keep only its own.

use std::sync::Arc;

use drill_sorter::connection::{ConnectionState, SerialConnection};
use drill_sorter::error::{ConnectionError, ReceiveError};
use drill_sorter::transport::{MockTransport, PortOptions};
use parking_lot::Mutex;

type Log = Arc<Mutex<Vec<String>>>;

/// Record every event of `connection` into one ordered log.
fn record_events(connection: &mut SerialConnection) -> Log {
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let sink = log.clone();
    connection.on_connect(move || sink.lock().push("connect".to_string()));
    let sink = log.clone();
    connection.on_line(move |line| sink.lock().push(format!("line {line:?}")));
    let sink = log.clone();
    connection.on_error(move |error| sink.lock().push(format!("error {error}")));

    log
}

#[tokio::test]
async fn test_two_connections_share_a_transport() {
    let transport = Arc::new(MockTransport::new());
    let mut caliper = SerialConnection::new("caliper", transport.clone());
    let mut robot = SerialConnection::new("robot", transport.clone());
    let caliper_log = record_events(&mut caliper);
    let robot_log = record_events(&mut robot);

    let caliper_id = caliper
        .connect("/dev/caliper", &PortOptions::with_baud_rate(115_200))
        .await
        .unwrap();
    let robot_id = robot
        .connect("/dev/robot", &PortOptions::with_baud_rate(38_400))
        .await
        .unwrap();
    assert_ne!(caliper_id, robot_id);

    transport.inject_bytes(caliper_id, b"1234\n");
    transport.inject_bytes(robot_id, b"%m\n");

    // Both inboxes see both events; each keeps one
    assert!(caliper.process_next().await);
    assert!(!caliper.process_next().await);
    assert!(!robot.process_next().await);
    assert!(robot.process_next().await);

    assert_eq!(*caliper_log.lock(), vec!["connect", "line \"1234\\n\""]);
    assert_eq!(*robot_log.lock(), vec!["connect", "line \"%m\\n\""]);
}

#[tokio::test]
async fn test_chunked_stream_reassembles_lines() {
    let transport = Arc::new(MockTransport::new());
    let mut caliper = SerialConnection::new("caliper", transport.clone());
    let log = record_events(&mut caliper);
    let id = caliper.connect("/dev/caliper", &PortOptions::default()).await.unwrap();

    for chunk in [&b"4"[..], b"2", b"\n1", b"00\n20", b"0\n\n"] {
        transport.inject_bytes(id, chunk);
        caliper.process_next().await;
    }

    assert_eq!(
        *log.lock(),
        vec![
            "connect",
            "line \"42\\n\"",
            "line \"100\\n\"",
            "line \"200\\n\"",
            "line \"\\n\""
        ]
    );
    assert_eq!(caliper.residual(), "");
}

#[tokio::test]
async fn test_error_then_recovery_keeps_streaming() {
    let transport = Arc::new(MockTransport::new());
    let mut robot = SerialConnection::new("robot", transport.clone());
    let log = record_events(&mut robot);
    let id = robot.connect("/dev/robot", &PortOptions::default()).await.unwrap();

    transport.inject_bytes(id, b"%");
    transport.inject_error(id, ReceiveError::FrameError);
    transport.inject_bytes(id, b"m\n");
    for _ in 0..3 {
        robot.process_next().await;
    }

    assert_eq!(robot.state(), ConnectionState::Open(id));
    assert_eq!(
        *log.lock(),
        vec!["connect", "error Framing error", "line \"%m\\n\""]
    );
}

#[tokio::test]
async fn test_failed_connect_then_retry_on_same_instance() {
    let transport = Arc::new(MockTransport::new());
    let mut caliper = SerialConnection::new("caliper", transport.clone());
    let log = record_events(&mut caliper);

    transport.trigger_connect_failure();
    let err = caliper
        .connect("/dev/missing", &PortOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::ConnectFailed { ref path, .. } if path == "/dev/missing"));
    assert_eq!(caliper.state(), ConnectionState::Unset);
    assert!(log.lock().is_empty());

    let id = caliper.connect("/dev/caliper", &PortOptions::default()).await.unwrap();
    assert_eq!(caliper.state(), ConnectionState::Open(id));
    assert_eq!(*log.lock(), vec!["connect"]);
}

#[tokio::test]
async fn test_closed_connection_is_inert() {
    let transport = Arc::new(MockTransport::new());
    let mut robot = SerialConnection::new("robot", transport.clone());
    let log = record_events(&mut robot);
    let id = robot.connect("/dev/robot", &PortOptions::default()).await.unwrap();

    robot.send("%01\n").unwrap();
    robot.disconnect().unwrap();

    // Late data for the closed port goes nowhere
    robot.handle_receive(id, b"%m\n");
    robot.handle_receive_error(id, &ReceiveError::DeviceLost);

    assert_eq!(*log.lock(), vec!["connect"]);
    assert_eq!(robot.send("%02\n"), Err(ConnectionError::Closed));
    assert_eq!(robot.disconnect(), Err(ConnectionError::Closed));
    assert!(matches!(
        robot.connect("/dev/robot", &PortOptions::default()).await,
        Err(ConnectionError::NotReusable { state: "closed" })
    ));
    assert_eq!(transport.sent_text(id), vec!["%01\n"]);
    assert!(!transport.is_open(id));
}

#[tokio::test]
async fn test_bounded_connection_reports_runaway_line() {
    let transport = Arc::new(MockTransport::new());
    let mut caliper = SerialConnection::new("caliper", transport.clone()).with_max_line_bytes(8);
    let log = record_events(&mut caliper);
    let id = caliper.connect("/dev/caliper", &PortOptions::default()).await.unwrap();

    caliper.handle_receive(id, b"12\n0123456789abcdef");
    caliper.handle_receive(id, b"34\n");

    let log = log.lock();
    assert_eq!(log[1], "line \"12\\n\"");
    assert!(log[2].starts_with("error Line exceeded 8 bytes"));
    assert_eq!(log[3], "line \"34\\n\"");
}
