//! Full daemon scenarios over the in-memory fake dongle:
//!   - cold start with and without a dongle present
//!   - resolve idempotence within a generation
//!   - proxy bridging against the loopback robot fleet
//!   - hot-unplug detection and recovery
//!   - dongle RPC version mismatch
//!   - cycle, ordered shutdown, and the control server end to end

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use botlink_client::{ClientError, DaemonClient};
use botlink_core::proto::{
    Body, Broadcast, Envelope, RecordCodec, Reply, Request, RPC_VERSION,
};
use botlink_core::{Status, Version};
use botlink_daemon::testing::FakeDongleIo;
use botlink_daemon::{ControlServer, DaemonService, DongleState};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn next_dongle_event(events: &mut broadcast::Receiver<Broadcast>) -> Status {
    loop {
        let event = timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for a dongle event")
            .expect("event channel closed");
        match event {
            Broadcast::DongleEvent { status } => return status,
            Broadcast::RobotEvent(_) => continue,
        }
    }
}

async fn await_dongle_status(events: &mut broadcast::Receiver<Broadcast>, want: Status) {
    loop {
        if next_dongle_event(events).await == want {
            return;
        }
    }
}

async fn resolve_endpoint(service: &DaemonService, serial: &str) -> Result<(String, u16), Status> {
    match service
        .handle(Request::ResolveSerialId { serial_id: serial.into() })
        .await
    {
        Reply::ResolveSerialId { status, endpoint } => match endpoint {
            Some(endpoint) if status.is_ok() => {
                Ok((endpoint.address().to_owned(), endpoint.port()))
            }
            _ => Err(status),
        },
        other => panic!("unexpected reply {other:?}"),
    }
}

// ── Cold start ──────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn cold_start_with_dongle_present() {
    let service = DaemonService::start(Arc::new(FakeDongleIo::new()));
    let mut events = service.subscribe();

    let status = timeout(Duration::from_secs(2), next_dongle_event(&mut events))
        .await
        .expect("no dongle event within two seconds");
    assert_eq!(status, Status::Ok);

    let (address, port) = resolve_endpoint(&service, "ABCD").await.unwrap();
    assert_eq!(address, "127.0.0.1");
    assert!((1024..=65535).contains(&port));

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cold_start_without_dongle_then_plug() {
    let io = Arc::new(FakeDongleIo::absent());
    let service = DaemonService::start(io.clone());
    let mut events = service.subscribe();

    // Nothing to resolve against while the dongle is missing.
    assert_eq!(
        resolve_endpoint(&service, "ABCD").await.unwrap_err(),
        Status::DongleNotFound
    );

    io.plug();
    await_dongle_status(&mut events, Status::Ok).await;
    assert!(resolve_endpoint(&service, "ABCD").await.is_ok());

    service.shutdown().await;
}

// ── Resolve semantics ───────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn resolve_is_idempotent_within_a_generation() {
    let service = DaemonService::start(Arc::new(FakeDongleIo::new()));
    let mut events = service.subscribe();
    await_dongle_status(&mut events, Status::Ok).await;

    let first = resolve_endpoint(&service, "ABCD").await.unwrap();
    let second = resolve_endpoint(&service, "ABCD").await.unwrap();
    assert_eq!(first, second);

    // Different serials get different proxies.
    let other = resolve_endpoint(&service, "WXYZ").await.unwrap();
    assert_ne!(first, other);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn resolve_validates_the_serial_id() {
    let service = DaemonService::start(Arc::new(FakeDongleIo::new()));
    let mut events = service.subscribe();
    await_dongle_status(&mut events, Status::Ok).await;

    for bad in ["ABC", "ABCDE", ""] {
        assert_eq!(
            resolve_endpoint(&service, bad).await.unwrap_err(),
            Status::InvalidSerialId
        );
    }

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cycle_yields_fresh_endpoints() {
    let service = DaemonService::start(Arc::new(FakeDongleIo::new()));
    let mut events = service.subscribe();
    await_dongle_status(&mut events, Status::Ok).await;

    let before = resolve_endpoint(&service, "ABCD").await.unwrap();

    match service.handle(Request::CycleDongle { seconds: 0 }).await {
        Reply::CycleDongle { status } => assert_eq!(status, Status::Ok),
        other => panic!("unexpected reply {other:?}"),
    }
    // Teardown broadcast, then the fresh generation.
    await_dongle_status(&mut events, Status::DongleNotFound).await;
    await_dongle_status(&mut events, Status::Ok).await;

    // Service is restored; the old proxy died with its generation, so the
    // endpoint is a fresh one.
    let after = resolve_endpoint(&service, "ABCD").await.unwrap();
    assert_ne!(before, after);

    service.shutdown().await;
}

// ── Proxy bridging ──────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn proxy_bridges_a_client_session_to_the_radio() {
    let service = DaemonService::start(Arc::new(FakeDongleIo::new()));
    let mut events = service.subscribe();
    await_dongle_status(&mut events, Status::Ok).await;

    let (address, port) = resolve_endpoint(&service, "ABCD").await.unwrap();
    let stream = tokio::net::TcpStream::connect((address.as_str(), port))
        .await
        .expect("proxy endpoint refused the connection");
    let mut session = Framed::new(stream, RecordCodec);

    // RPC connect handshake against the proxy.
    let connect = Envelope::request(1, Request::Connect { version: RPC_VERSION });
    session
        .send(Bytes::from(bincode::serialize(&connect).unwrap()))
        .await
        .unwrap();
    let reply_bytes = timeout(EVENT_TIMEOUT, session.next())
        .await
        .expect("no connect reply")
        .unwrap()
        .unwrap();
    let reply: Envelope = bincode::deserialize(&reply_bytes).unwrap();
    match reply.body {
        Body::Reply(Reply::Connect { status, version }) => {
            assert_eq!(status, Status::Ok);
            assert_eq!(version, RPC_VERSION);
        }
        other => panic!("unexpected handshake reply {other:?}"),
    }

    // The fake fleet loops every robot frame back.
    for payload in [&b"hello robot"[..], &b"second frame"[..]] {
        session.send(Bytes::copy_from_slice(payload)).await.unwrap();
        let echoed = timeout(EVENT_TIMEOUT, session.next())
            .await
            .expect("no echo from the loopback robot")
            .unwrap()
            .unwrap();
        assert_eq!(&echoed[..], payload);
    }

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn proxy_rejects_mismatched_connect() {
    let service = DaemonService::start(Arc::new(FakeDongleIo::new()));
    let mut events = service.subscribe();
    await_dongle_status(&mut events, Status::Ok).await;

    let (address, port) = resolve_endpoint(&service, "ABCD").await.unwrap();
    let stream = tokio::net::TcpStream::connect((address.as_str(), port)).await.unwrap();
    let mut session = Framed::new(stream, RecordCodec);

    let ancient = Version::new(RPC_VERSION.major + 1, 0, 0);
    let connect = Envelope::request(1, Request::Connect { version: ancient });
    session
        .send(Bytes::from(bincode::serialize(&connect).unwrap()))
        .await
        .unwrap();

    let reply_bytes = timeout(EVENT_TIMEOUT, session.next())
        .await
        .expect("no connect reply")
        .unwrap()
        .unwrap();
    let reply: Envelope = bincode::deserialize(&reply_bytes).unwrap();
    match reply.body {
        Body::Reply(Reply::Connect { status, .. }) => {
            assert_eq!(status, Status::RpcVersionMismatch)
        }
        other => panic!("unexpected handshake reply {other:?}"),
    }
    // The proxy hangs up on mismatched clients.
    assert!(timeout(EVENT_TIMEOUT, session.next()).await.unwrap().is_none());

    service.shutdown().await;
}

// ── Robot events ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn ping_triggers_robot_events() {
    let service = DaemonService::start(Arc::new(FakeDongleIo::new()));
    let mut events = service.subscribe();
    await_dongle_status(&mut events, Status::Ok).await;

    match service
        .handle(Request::SendRobotPing {
            destinations: vec!["ABCD".into(), "WXYZ".into()],
        })
        .await
    {
        Reply::SendRobotPing { status } => assert_eq!(status, Status::Ok),
        other => panic!("unexpected reply {other:?}"),
    }

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let event = timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for robot events")
            .expect("event channel closed");
        if let Broadcast::RobotEvent(event) = event {
            seen.push(event.serial_id.to_string());
        }
    }
    seen.sort();
    assert_eq!(seen, vec!["ABCD".to_string(), "WXYZ".to_string()]);

    service.shutdown().await;
}

// ── Hot-unplug ──────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn hot_unplug_is_detected_and_recovered() {
    let io = Arc::new(FakeDongleIo::new());
    let service = DaemonService::start(io.clone());
    let mut events = service.subscribe();
    await_dongle_status(&mut events, Status::Ok).await;

    let before = resolve_endpoint(&service, "WXYZ").await.unwrap();

    io.unplug();
    // Detection must fit within ERROR_DOWNTIME + POLL_INTERVAL, with slack.
    timeout(
        Duration::from_secs(2),
        await_dongle_status(&mut events, Status::DongleNotFound),
    )
    .await
    .expect("unplug was not broadcast in time");

    // Every proxy died with its generation.
    assert_eq!(
        resolve_endpoint(&service, "WXYZ").await.unwrap_err(),
        Status::DongleNotFound
    );

    io.plug();
    await_dongle_status(&mut events, Status::Ok).await;
    let after = resolve_endpoint(&service, "WXYZ").await.unwrap();
    assert_ne!(before, after);

    service.shutdown().await;
}

// ── Version mismatch ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn dongle_version_mismatch_is_broadcast_and_retried() {
    let incompatible = Version::new(RPC_VERSION.major + 1, 0, 0);
    let service = DaemonService::start(Arc::new(FakeDongleIo::with_version(incompatible)));
    let mut events = service.subscribe();

    await_dongle_status(&mut events, Status::DongleVersionMismatch).await;
    assert!(!matches!(service.dongle_state(), DongleState::Live(_)));

    // It keeps retrying (and keeps failing) rather than giving up.
    await_dongle_status(&mut events, Status::DongleVersionMismatch).await;
    assert_eq!(
        resolve_endpoint(&service, "ABCD").await.unwrap_err(),
        Status::DongleNotFound
    );

    service.shutdown().await;
}

// ── Control server end to end ───────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn control_server_serves_clients_and_broadcasts() {
    let service = DaemonService::start(Arc::new(FakeDongleIo::new()));
    let server = ControlServer::bind("127.0.0.1:0".parse().unwrap(), service.clone())
        .await
        .unwrap();
    let client = DaemonClient::new(server.local_addr());

    let mut events = client.subscribe().await.unwrap();
    let endpoint = timeout(EVENT_TIMEOUT, async {
        loop {
            if let Ok(endpoint) = client.resolve_serial_id("ABCD").await {
                return endpoint;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("daemon never became resolvable");
    assert_eq!(endpoint.address(), "127.0.0.1");

    client.send_robot_ping(&["ABCD".to_string()]).await.unwrap();

    // The subscription connection carries the robot announcement.
    let robot = timeout(EVENT_TIMEOUT, async {
        loop {
            match events.next().await.expect("event stream ended").unwrap() {
                Broadcast::RobotEvent(event) => return event,
                Broadcast::DongleEvent { .. } => continue,
            }
        }
    })
    .await
    .expect("no robot event reached the subscriber");
    assert_eq!(robot.serial_id.to_string(), "ABCD");

    // Invalid serials are refused with a status, end to end.
    match client.resolve_serial_id("TOO-LONG").await {
        Err(ClientError::Status(Status::InvalidSerialId)) => {}
        other => panic!("expected InvalidSerialId, got {other:?}"),
    }

    server.stop().await;
    service.shutdown().await;

    // With the server gone, clients see the daemon as unavailable.
    tokio::time::sleep(Duration::from_millis(50)).await;
    match client.resolve_serial_id("ABCD").await {
        Err(ClientError::DaemonUnavailable | ClientError::ConnectionClosed) => {}
        other => panic!("expected an unavailable daemon, got {other:?}"),
    }
}

// ── Ordered shutdown ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_completes_promptly() {
    let service = DaemonService::start(Arc::new(FakeDongleIo::new()));
    let mut events = service.subscribe();
    await_dongle_status(&mut events, Status::Ok).await;
    let _ = resolve_endpoint(&service, "ABCD").await.unwrap();

    timeout(Duration::from_secs(1), service.shutdown())
        .await
        .expect("shutdown took longer than one second");

    // The supervisor is gone; further requests abort rather than hang.
    match service
        .handle(Request::ResolveSerialId { serial_id: "ABCD".into() })
        .await
    {
        Reply::ResolveSerialId { status, .. } => {
            assert_eq!(status, Status::OperationAborted)
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_while_no_dongle_is_clean() {
    let service = DaemonService::start(Arc::new(FakeDongleIo::absent()));
    timeout(Duration::from_secs(1), service.shutdown())
        .await
        .expect("idle shutdown took longer than one second");
}
