mod common;

use common::{init_tracing, StubTransport};
use heos_control::{
    ClientConfig, CommandResult, Fault, HeosClient, HeosCommand, HeosError, Response,
    SessionState, HEOS_PORT,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const HEARTBEAT_LINE: &str =
    "{\"heos\": {\"command\": \"system/heart_beat\", \"result\": \"success\", \"message\": \"m\"}}\r\n";

fn device_ip() -> IpAddr {
    "192.168.0.7".parse().unwrap()
}

fn cmd(s: &str) -> HeosCommand {
    s.parse().unwrap()
}

fn stub_client() -> (HeosClient, DuplexStream, Arc<StubTransport>) {
    let (device, stream) = tokio::io::duplex(4096);
    let transport = StubTransport::with_stream(stream);
    let client = HeosClient::with_transport(device_ip(), transport.clone());
    (client, device, transport)
}

fn line(command: &str, result: &str, message: &str) -> String {
    format!(
        "{{\"heos\": {{\"command\": \"{}\", \"result\": \"{}\", \"message\": \"{}\"}}}}\r\n",
        command, result, message
    )
}

#[tokio::test]
async fn connected_before_first_line_is_delivered() {
    init_tracing();
    let (client, mut device, transport) = stub_client();

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        let handle = client.clone();
        client.events().on(cmd("system/heart_beat"), move |response| {
            seen.lock()
                .unwrap()
                .push((handle.is_connected(), response.header.result));
            async {}
        });
    }

    device.write_all(HEARTBEAT_LINE.as_bytes()).await.unwrap();
    drop(device);

    assert_eq!(client.state(), SessionState::Idle);
    client.run().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![(true, CommandResult::Success)]);
    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(
        transport.connected_to(),
        vec![SocketAddr::new(device_ip(), HEOS_PORT)]
    );
}

#[tokio::test]
async fn connect_returns_while_session_keeps_reading() {
    let (client, mut device, _transport) = stub_client();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.events().on(cmd("system/heart_beat"), move |response: Arc<Response>| {
        let _ = tx.send(response.header.message.raw().to_string());
        async {}
    });

    client.connect().await.unwrap();
    assert!(client.is_connected());

    device.write_all(HEARTBEAT_LINE.as_bytes()).await.unwrap();
    assert_eq!(rx.recv().await.as_deref(), Some("m"));
    assert!(client.is_connected());

    drop(device);
    client.wait().await.unwrap();
    assert!(!client.is_connected());
}

#[tokio::test]
async fn lines_are_delivered_in_wire_order() {
    let (client, mut device, _transport) = stub_client();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        client.events().on_all(move |response| {
            let seen = Arc::clone(&seen);
            async move {
                // slow listener; later lines must wait for it
                tokio::time::sleep(Duration::from_millis(5)).await;
                seen.lock()
                    .unwrap()
                    .push(response.header.message.raw().to_string());
            }
        });
    }

    for n in 1..=5 {
        let msg = format!("n={}", n);
        device
            .write_all(line("system/heart_beat", "success", &msg).as_bytes())
            .await
            .unwrap();
    }
    drop(device);

    client.run().await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["n=1", "n=2", "n=3", "n=4", "n=5"]);
}

#[tokio::test]
async fn bad_line_is_reported_and_session_continues() {
    let (client, mut device, _transport) = stub_client();
    let mut faults = client.events().faults();
    let count = Arc::new(Mutex::new(0));
    {
        let count = Arc::clone(&count);
        client.events().on(cmd("system/heart_beat"), move |_response| {
            *count.lock().unwrap() += 1;
            async {}
        });
    }

    device.write_all(b"{\"heos\": 42}\r\n").await.unwrap();
    device.write_all(HEARTBEAT_LINE.as_bytes()).await.unwrap();
    drop(device);

    client.run().await.unwrap();

    assert_eq!(*count.lock().unwrap(), 1);
    assert!(matches!(
        faults.try_recv().unwrap(),
        Some(Fault::Decode { .. })
    ));
}

#[tokio::test]
async fn send_writes_request_line() {
    let (client, device, _transport) = stub_client();
    client.connect().await.unwrap();

    client
        .send(&cmd("player/get_volume").with_attribute("pid", 1))
        .await
        .unwrap();

    let mut lines = BufReader::new(device).lines();
    assert_eq!(
        lines.next_line().await.unwrap().as_deref(),
        Some("heos://player/get_volume?pid=1")
    );

    client.disconnect().await;
}

#[tokio::test]
async fn send_rejects_bad_attribute_before_writing() {
    let (client, _device, _transport) = stub_client();
    client.connect().await.unwrap();

    let err = client
        .send(&cmd("player/get_volume").with_attribute("", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, HeosError::InvalidArgument(_)));

    client.disconnect().await;
}

#[tokio::test]
async fn send_requires_connection() {
    let (client, _device, _transport) = stub_client();
    let err = client.send(&cmd("system/heart_beat")).await.unwrap_err();
    assert!(matches!(err, HeosError::NotConnected));
}

#[tokio::test]
async fn request_skips_interim_ack_and_returns_result() {
    let (client, device, _transport) = stub_client();
    client.connect().await.unwrap();

    let device_task = tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(device);
        let mut lines = BufReader::new(read).lines();
        let request = lines.next_line().await.unwrap().unwrap();

        write
            .write_all(line("player/get_volume", "success", "command under process").as_bytes())
            .await
            .unwrap();
        write
            .write_all(line("player/get_volume", "success", "pid=1&level=25").as_bytes())
            .await
            .unwrap();
        // hand both halves back so the stream stays open
        (request, lines, write)
    });

    let response = client
        .request(&cmd("player/get_volume").with_attribute("pid", 1))
        .await
        .unwrap();

    assert_eq!(response.header.message.get("level").as_deref(), Some("25"));
    let (request, _lines, _write) = device_task.await.unwrap();
    assert_eq!(request, "heos://player/get_volume?pid=1");
    // the temporary listener is gone
    assert_eq!(client.events().listener_count(), 0);

    client.disconnect().await;
}

#[tokio::test]
async fn request_maps_fail_result_to_error() {
    let (client, device, _transport) = stub_client();
    client.connect().await.unwrap();

    let device_task = tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(device);
        let mut lines = BufReader::new(read).lines();
        lines.next_line().await.unwrap();
        write
            .write_all(line("player/get_volume", "fail", "eid=2&text=ID Not Valid&pid=9").as_bytes())
            .await
            .unwrap();
        (lines, write)
    });

    let err = client
        .request(&cmd("player/get_volume").with_attribute("pid", 9))
        .await
        .unwrap_err();
    match err {
        HeosError::CommandFailed { command, message } => {
            assert_eq!(command, "player/get_volume");
            assert!(message.contains("eid=2"));
        }
        other => panic!("expected CommandFailed, got {:?}", other),
    }

    let _keepalive = device_task.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn request_times_out() {
    let (device, stream) = tokio::io::duplex(4096);
    let config = ClientConfig {
        request_timeout: Duration::from_millis(50),
        ..ClientConfig::default()
    };
    let client = HeosClient::with_options(device_ip(), config, StubTransport::with_stream(stream));
    client.connect().await.unwrap();

    let err = client.request(&cmd("system/heart_beat")).await.unwrap_err();
    assert!(matches!(err, HeosError::Timeout));
    assert_eq!(client.events().listener_count(), 0);

    drop(device);
    client.wait().await.unwrap();
}

#[tokio::test]
async fn request_fails_when_connection_closes() {
    let (client, device, _transport) = stub_client();
    client.connect().await.unwrap();

    tokio::spawn(async move {
        let mut lines = BufReader::new(device).lines();
        lines.next_line().await.unwrap();
        // dropping the device end closes the session
    });

    let err = client.request(&cmd("system/heart_beat")).await.unwrap_err();
    assert!(matches!(err, HeosError::ConnectionClosed));
}

#[tokio::test]
async fn disconnect_ends_session_for_good() {
    let (client, _device, _transport) = stub_client();
    let mut state = client.subscribe_state();

    client.connect().await.unwrap();
    assert!(matches!(
        client.connect().await,
        Err(HeosError::AlreadyConnected)
    ));

    client.disconnect().await;
    client.wait().await.unwrap();

    state.changed().await.unwrap();
    assert_eq!(*state.borrow(), SessionState::Closed);
    assert!(matches!(client.connect().await, Err(HeosError::SessionClosed)));
    assert!(matches!(
        client.send(&cmd("system/heart_beat")).await,
        Err(HeosError::NotConnected)
    ));
}

#[tokio::test]
async fn connect_can_be_cancelled() {
    let client = HeosClient::with_transport(device_ip(), StubTransport::unreachable());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = client.connect_with_cancel(&cancel).await.unwrap_err();
    assert!(matches!(err, HeosError::Cancelled));
    assert_eq!(client.state(), SessionState::Idle);
    assert!(matches!(client.wait().await, Err(HeosError::NotConnected)));
}

#[tokio::test]
async fn talks_to_a_real_tcp_device() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let device = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();
        let request = lines.next_line().await.unwrap().unwrap();
        write
            .write_all(line("system/heart_beat", "success", "").as_bytes())
            .await
            .unwrap();
        request
    });

    let config = ClientConfig {
        port,
        ..ClientConfig::default()
    };
    let client = HeosClient::with_options(
        "127.0.0.1".parse().unwrap(),
        config,
        Arc::new(heos_control::TokioTransport),
    );
    client.connect().await.unwrap();

    let response = client.request(&cmd("system/heart_beat")).await.unwrap();
    assert!(response.is_success());
    assert_eq!(device.await.unwrap(), "heos://system/heart_beat");

    // device task dropped its socket, so the session ends on its own
    client.wait().await.unwrap();
    assert_eq!(client.state(), SessionState::Closed);
}

#[tokio::test]
async fn every_waiter_blocks_until_session_ends() {
    let (client, device, _transport) = stub_client();
    client.connect().await.unwrap();

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.wait().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = tokio::time::timeout(Duration::from_millis(100), client.wait()).await;
    assert!(second.is_err(), "second wait returned while still connected");
    assert!(client.is_connected());

    drop(device);
    client.wait().await.unwrap();
    first.await.unwrap().unwrap();
    assert_eq!(client.state(), SessionState::Closed);
}

#[tokio::test]
async fn disconnect_while_connecting_stays_closed() {
    let (_device, stream) = tokio::io::duplex(4096);
    let gate = Arc::new(Notify::new());
    let client = HeosClient::with_transport(device_ip(), StubTransport::gated(stream, gate.clone()));
    let mut state = client.subscribe_state();

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    state
        .wait_for(|s| *s == SessionState::Connecting)
        .await
        .unwrap();

    client.disconnect().await;
    gate.notify_one();

    let result = connecting.await.unwrap();
    assert!(matches!(result, Err(HeosError::SessionClosed)));
    assert_eq!(client.state(), SessionState::Closed);
    assert!(!client.is_connected());
    assert!(matches!(client.connect().await, Err(HeosError::SessionClosed)));
}

#[tokio::test]
async fn refused_connect_while_closing_does_not_reopen() {
    let gate = Arc::new(Notify::new());
    let client = HeosClient::with_transport(device_ip(), StubTransport::refusing(gate.clone()));
    let mut state = client.subscribe_state();

    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    state
        .wait_for(|s| *s == SessionState::Connecting)
        .await
        .unwrap();

    client.disconnect().await;
    gate.notify_one();

    assert!(connecting.await.unwrap().is_err());
    assert_eq!(client.state(), SessionState::Closed);
}

#[tokio::test]
async fn refused_connect_returns_to_idle() {
    let gate = Arc::new(Notify::new());
    gate.notify_one();
    let client = HeosClient::with_transport(device_ip(), StubTransport::refusing(gate));

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, HeosError::Io(_)));
    assert_eq!(client.state(), SessionState::Idle);
}

#[tokio::test]
async fn request_from_inside_listener_times_out() {
    let (mut device, stream) = tokio::io::duplex(4096);
    let config = ClientConfig {
        request_timeout: Duration::from_millis(50),
        ..ClientConfig::default()
    };
    let client = HeosClient::with_options(device_ip(), config, StubTransport::with_stream(stream));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    {
        let handle = client.clone();
        client.events().once(cmd("system/heart_beat"), move |_response| {
            let handle = handle.clone();
            let tx = tx.clone();
            async move {
                let outcome = handle.request(&cmd("player/get_players")).await;
                let _ = tx.send(outcome.map(|_| ()));
            }
        });
    }

    client.connect().await.unwrap();
    device.write_all(HEARTBEAT_LINE.as_bytes()).await.unwrap();
    // the answer is already buffered, but the read loop is busy with the listener
    device
        .write_all(line("player/get_players", "success", "").as_bytes())
        .await
        .unwrap();

    assert!(matches!(rx.recv().await, Some(Err(HeosError::Timeout))));
    client.disconnect().await;
}
