use super::helpers::*;
use std::time::Duration;
use tensorlink::{ConnectionState, Envelope, TransportConfig, TransportError};

/// Bound on any call that must fail fast rather than hang.
const PROMPT: Duration = Duration::from_secs(1);

fn assert_not_connected<T: std::fmt::Debug>(result: tensorlink::Result<T>, state: ConnectionState) {
    match result {
        Err(TransportError::NotConnected { state: s }) => assert_eq!(s, state),
        other => panic!("expected NotConnected({state}), got {other:?}"),
    }
}

// ── Before the connection exists ────────────────────────────────────

#[tokio::test]
async fn test_idle_session_rejects_every_data_op() {
    let client = session(fast_config());
    let idle = ConnectionState::Idle;

    assert_not_connected(client.post_write(0usize, 0usize), idle);
    assert_not_connected(client.post_read(0usize, 0usize), idle);
    assert_not_connected(
        tokio::time::timeout(PROMPT, client.write(0usize, 0usize))
            .await
            .unwrap(),
        idle,
    );
    assert_not_connected(
        tokio::time::timeout(PROMPT, client.recv(0usize, 0usize))
            .await
            .unwrap(),
        idle,
    );
    assert_not_connected(
        tokio::time::timeout(PROMPT, client.send_message(&Envelope::new(1, "t", "x")))
            .await
            .unwrap(),
        idle,
    );
    assert_not_connected(
        tokio::time::timeout(PROMPT, client.send(0, 1, "t"))
            .await
            .unwrap(),
        idle,
    );
    assert_not_connected(
        tokio::time::timeout(PROMPT, client.notify("t")).await.unwrap(),
        idle,
    );
    assert_not_connected(
        tokio::time::timeout(PROMPT, client.recv_message())
            .await
            .unwrap(),
        idle,
    );
    assert!(client.remote_buffers().is_none());
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_handshaking_session_rejects_data_ops() {
    // Accepts the TCP connection but never sends a hello.
    let listener = tokio::net::TcpListener::bind(loopback()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = session(TransportConfig {
        connect_timeout: Duration::from_secs(1),
        ..fast_config()
    });

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect(addr).await })
    };
    wait_for_state(&client, ConnectionState::Handshaking).await;

    assert_not_connected(
        client.post_write(0usize, 0usize),
        ConnectionState::Handshaking,
    );
    assert_not_connected(
        tokio::time::timeout(PROMPT, client.send_message(&Envelope::new(1, "t", "x")))
            .await
            .unwrap(),
        ConnectionState::Handshaking,
    );
    assert_not_connected(
        tokio::time::timeout(PROMPT, client.recv_message())
            .await
            .unwrap(),
        ConnectionState::Handshaking,
    );

    let result = connecting.await.unwrap();
    assert!(matches!(result, Err(TransportError::Connect { .. })));
    assert_eq!(client.state(), ConnectionState::Closed);
    drop(listener);
}

#[tokio::test]
async fn test_listen_then_shutdown() {
    let server = session(fast_config());
    let addr = server.listen().await.unwrap();
    assert_eq!(server.state(), ConnectionState::Connecting);
    assert_eq!(server.connection_info().local_addr, addr);

    let waiter = {
        let server = server.clone();
        tokio::spawn(async move { server.wait_established().await })
    };
    server.shutdown().await;
    assert_eq!(server.state(), ConnectionState::Closed);
    assert!(matches!(
        waiter.await.unwrap(),
        Err(TransportError::ConnectionClosed)
    ));

    let client = session(fast_config());
    assert!(matches!(
        client.connect(addr).await,
        Err(TransportError::Connect { .. })
    ));
}

// ── Shutdown ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_resolves_every_in_flight_op() {
    const OPS: usize = 32;
    let dst = HostBuffer::zeroed(1 << 20);
    let src = HostBuffer::pattern(1 << 20, 17);
    let server = session(fast_config());
    let client = session(TransportConfig {
        drain_timeout: Duration::ZERO,
        ..fast_config()
    });
    register(&server, &dst);
    register(&client, &src);
    connect_pair(&server, &client).await;

    let ops: Vec<_> = (0..OPS)
        .map(|_| client.post_write(0usize, 0usize).unwrap())
        .collect();
    client.shutdown().await;

    for op in ops {
        match tokio::time::timeout(Duration::from_secs(5), op).await {
            Ok(Ok(())) | Ok(Err(TransportError::ConnectionLost(_))) => {}
            Ok(Err(e)) => panic!("unexpected error: {e}"),
            Err(_) => panic!("operation never resolved after shutdown"),
        }
    }
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.state(), ConnectionState::Closed);
    wait_for_state(&server, ConnectionState::Closed).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_drains_in_flight_ops() {
    const OPS: usize = 16;
    let dst = HostBuffer::zeroed(1 << 20);
    let src = HostBuffer::pattern(1 << 20, 29);
    let server = session(fast_config());
    let client = session(TransportConfig {
        drain_timeout: Duration::from_secs(5),
        ..fast_config()
    });
    register(&server, &dst);
    register(&client, &src);
    connect_pair(&server, &client).await;

    let ops: Vec<_> = (0..OPS)
        .map(|_| client.post_write(0usize, 0usize).unwrap())
        .collect();
    client.shutdown().await;

    for op in ops {
        tokio::time::timeout(Duration::from_secs(5), op)
            .await
            .expect("operation never resolved after shutdown")
            .unwrap();
    }
    assert_eq!(dst.to_vec(), src.to_vec());
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unregister_during_write_keeps_source_alive() {
    const LEN: usize = 16 << 20;
    let dst = HostBuffer::zeroed(LEN);
    let src = HostBuffer::pattern(LEN, 41);
    let server = session(fast_config());
    let client = session(fast_config());
    register(&server, &dst);
    let index = register(&client, &src);
    connect_pair(&server, &client).await;

    let op = client.post_write(index, 0usize).unwrap();
    assert!(client.unregister(index));
    assert_eq!(client.connection_info().local_regions, 0);

    tokio::time::timeout(Duration::from_secs(10), op)
        .await
        .expect("write never resolved")
        .unwrap();
    assert_eq!(dst.to_vec(), src.to_vec());
    assert_eq!(client.state(), ConnectionState::Established);
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_terminal() {
    let buf = HostBuffer::zeroed(64);
    let server = session(fast_config());
    let client = session(fast_config());
    register(&client, &buf);
    connect_pair(&server, &client).await;
    let addr = server.connection_info().local_addr;

    tokio::join!(client.shutdown(), client.shutdown());
    client.shutdown().await;
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(client.connection_info().close_reason.is_none());

    assert_not_connected(client.post_write(0usize, 0usize), ConnectionState::Closed);
    assert!(matches!(
        client.recv_message().await,
        Err(TransportError::ConnectionClosed)
    ));
    assert!(matches!(
        client.connect(addr).await,
        Err(TransportError::ConnectionClosed)
    ));
    assert!(matches!(
        unsafe { client.register_buffer(buf.addr(), 0, buf.len()) },
        Err(TransportError::ConnectionClosed)
    ));
    // Shutdown released every registration.
    assert_eq!(client.connection_info().local_regions, 0);
}

#[tokio::test]
async fn test_peer_shutdown_closes_local_side() {
    let (server, client) = connected(fast_config()).await;

    client.shutdown().await;
    wait_for_state(&server, ConnectionState::Closed).await;

    assert!(server.connection_info().close_reason.is_some());
    assert_not_connected(
        tokio::time::timeout(PROMPT, server.send_message(&Envelope::new(1, "t", "x")))
            .await
            .unwrap(),
        ConnectionState::Closed,
    );
    assert!(matches!(
        tokio::time::timeout(PROMPT, server.recv_message())
            .await
            .unwrap(),
        Err(TransportError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_buffered_messages_survive_peer_close() {
    let (server, client) = connected(fast_config()).await;

    for id in 1..=3 {
        client
            .send_message(&Envelope::new(id, "late", "x"))
            .await
            .unwrap();
    }
    client.shutdown().await;
    wait_for_state(&server, ConnectionState::Closed).await;

    for id in 1..=3 {
        assert_eq!(server.recv_message().await.unwrap().id, id);
    }
    assert!(matches!(
        tokio::time::timeout(PROMPT, server.recv_message())
            .await
            .unwrap(),
        Err(TransportError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_pending_recv_wakes_on_shutdown() {
    let (server, _client) = connected(fast_config()).await;

    let receiver = {
        let server = server.clone();
        tokio::spawn(async move { server.recv_message().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(5), receiver)
        .await
        .expect("recv_message hung after shutdown")
        .unwrap();
    assert!(matches!(result, Err(TransportError::ConnectionClosed)));
}

// ── Peer failure ────────────────────────────────────────────────────

#[tokio::test]
async fn test_dropped_peer_closes_with_reason() {
    let (server, client) = connected(fast_config()).await;

    drop(client);
    wait_for_state(&server, ConnectionState::Closed).await;

    let info = server.connection_info();
    assert!(info.close_reason.is_some());
    assert_eq!(info.in_flight, 0);
    assert_not_connected(server.post_read(0usize, 0usize), ConnectionState::Closed);
}
