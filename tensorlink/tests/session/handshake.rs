use super::helpers::*;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tensorlink::fabric::soft::SoftFabric;
use tensorlink::fabric::{Fabric, PreparedQueuePair, QueueParams, RegisteredMemory};
use tensorlink::{ConnectionState, Envelope, FabricKind, Role, Session, TransportError};

#[tokio::test]
async fn test_handshake_exchanges_buffer_sets() {
    let server_buf = HostBuffer::zeroed(1 << 20);
    let client_buf = HostBuffer::zeroed(4096);
    let server = session(fast_config());
    let client = session(fast_config());
    register(&server, &server_buf);
    register(&client, &client_buf);

    let (from_server, from_client) = connect_pair(&server, &client).await;

    assert_eq!(from_server.len(), 1);
    let region = from_server.get(0).unwrap();
    assert_eq!(region.base_address, server_buf.addr());
    assert_eq!(region.offset, 0);
    assert_eq!(region.length, 1 << 20);
    assert_eq!(from_client.get(0).unwrap().length, 4096);
    assert_eq!(client.remote_buffers().unwrap(), from_server);

    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(server.state(), ConnectionState::Established);

    let info = client.connection_info();
    assert_eq!(info.role, Some(Role::Client));
    assert_eq!(info.remote_regions, 1);
    assert_eq!(info.local_regions, 1);
    assert_eq!(info.fabric, "soft");
    assert!(info.peer_addr.is_some());
    assert_eq!(server.connection_info().role, Some(Role::Server));

    client.shutdown().await;
    wait_for_state(&server, ConnectionState::Closed).await;
}

#[tokio::test]
async fn test_buffer_set_keeps_registration_order() {
    let bufs = [
        HostBuffer::zeroed(64),
        HostBuffer::zeroed(128),
        HostBuffer::zeroed(256),
    ];
    let server = session(fast_config());
    let client = session(fast_config());
    for (i, buf) in bufs.iter().enumerate() {
        assert_eq!(register(&server, buf), i);
    }

    let (from_server, from_client) = connect_pair(&server, &client).await;

    assert!(from_client.is_empty());
    assert_eq!(
        from_server.get_base_addresses(),
        bufs.iter().map(HostBuffer::addr).collect::<Vec<_>>()
    );
    let lengths: Vec<u64> = from_server.iter().map(|r| r.length).collect();
    assert_eq!(lengths, vec![64, 128, 256]);
    assert_eq!(from_server.total_bytes(), 448);
}

#[tokio::test]
async fn test_connect_refused() {
    let addr = {
        let listener = tokio::net::TcpListener::bind(loopback()).await.unwrap();
        listener.local_addr().unwrap()
    };
    let client = session(fast_config());

    let err = client.connect(addr).await.unwrap_err();
    assert!(matches!(err, TransportError::Connect { .. }), "got {err}");
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_connect_times_out_on_silent_listener() {
    // Accepts at the TCP level (backlog) but never speaks.
    let listener = tokio::net::TcpListener::bind(loopback()).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = fast_config();
    config.connect_timeout = Duration::from_millis(300);
    let client = session(config);

    let start = Instant::now();
    let err = client.connect(addr).await.unwrap_err();
    let elapsed = start.elapsed();

    match &err {
        TransportError::Connect { addr: a, reason } => {
            assert_eq!(a, &addr.to_string());
            assert!(reason.contains("timed out"), "reason: {reason}");
        }
        other => panic!("expected Connect, got {other}"),
    }
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(client.connection_info().close_reason.is_some());
    drop(listener);
}

#[tokio::test]
async fn test_second_client_is_turned_away() {
    let server = session(fast_config());
    let first = session(fast_config());
    let second = session(fast_config());
    connect_pair(&server, &first).await;
    let addr = server.connection_info().local_addr;

    let err = second.connect(addr).await.unwrap_err();
    assert!(matches!(err, TransportError::AlreadyConnected), "got {err}");
    assert_eq!(second.state(), ConnectionState::Closed);

    // The existing connection is unaffected.
    assert_eq!(server.state(), ConnectionState::Established);
    first
        .send_message(&Envelope::new(9, "still-here", "ok"))
        .await
        .unwrap();
    let env = server.recv_message().await.unwrap();
    assert_eq!(env.id, 9);
    assert_eq!(env.tag_str(), Some("still-here"));
}

#[tokio::test]
async fn test_connect_twice_on_one_session() {
    let (server, client) = connected(fast_config()).await;
    let addr = server.connection_info().local_addr;

    assert!(matches!(
        client.connect(addr).await,
        Err(TransportError::AlreadyConnected)
    ));
    assert!(matches!(
        server.listen().await,
        Err(TransportError::AlreadyConnected)
    ));
    assert_eq!(client.state(), ConnectionState::Established);
}

/// Soft fabric that claims to be a verbs device.
struct MislabeledFabric(SoftFabric);

impl Fabric for MislabeledFabric {
    fn kind(&self) -> FabricKind {
        FabricKind::Verbs { device_index: 0 }
    }

    fn name(&self) -> &'static str {
        "mislabeled"
    }

    unsafe fn register(
        &self,
        addr: u64,
        len: u64,
    ) -> tensorlink::Result<Box<dyn RegisteredMemory>> {
        unsafe { self.0.register(addr, len) }
    }

    fn prepare<'a>(
        &'a self,
        role: Role,
        local: SocketAddr,
        peer: SocketAddr,
        params: QueueParams,
    ) -> BoxFuture<'a, tensorlink::Result<Box<dyn PreparedQueuePair>>> {
        self.0.prepare(role, local, peer, params)
    }
}

#[tokio::test]
async fn test_fabric_mismatch_fails_both_sides() {
    let server = session(fast_config());
    let client = Session::with_fabric(
        loopback(),
        Arc::new(MislabeledFabric(SoftFabric::new())),
        fast_config(),
    );
    let addr = server.listen().await.unwrap();

    let err = client.connect(addr).await.unwrap_err();
    match &err {
        TransportError::Connect { reason, .. } => {
            assert!(reason.contains("fabric mismatch"), "reason: {reason}");
        }
        other => panic!("expected Connect, got {other}"),
    }
    assert_eq!(client.state(), ConnectionState::Closed);
    wait_for_state(&server, ConnectionState::Closed).await;
}
