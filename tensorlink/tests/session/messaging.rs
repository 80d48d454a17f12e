use super::helpers::*;
use std::time::Duration;
use tensorlink::{
    ConnectionState, Envelope, EnvelopeKind, OpKind, SendMode, TransportConfig, TransportError,
};

fn shallow_config(depth: u32) -> TransportConfig {
    TransportConfig {
        recv_queue_depth: depth,
        ..fast_config()
    }
}

#[tokio::test]
async fn test_ten_messages_arrive_in_order() {
    let (server, client) = connected(fast_config()).await;

    for _ in 0..10 {
        client
            .send_message(&Envelope::new(1, "abcdefg", "hi"))
            .await
            .unwrap();
    }
    for _ in 0..10 {
        let env = server.recv_message().await.unwrap();
        assert_eq!(env.id, 1);
        assert_eq!(env.tag_str(), Some("abcdefg"));
        assert_eq!(&env.payload[..], b"hi");
        assert_eq!(env.length, 2);
        assert_eq!(env.kind, EnvelopeKind::Message);
    }
}

#[tokio::test]
async fn test_fifo_with_small_window() {
    const COUNT: u64 = 200;
    let (server, client) = connected(shallow_config(2)).await;

    let sender = tokio::spawn(async move {
        for i in 0..COUNT {
            let env = Envelope::new(i, "seq", i.to_le_bytes().to_vec());
            client.send_message(&env).await.unwrap();
        }
        client
    });

    for i in 0..COUNT {
        let env = server.recv_message().await.unwrap();
        assert_eq!(env.id, i, "message {i} out of order");
        assert_eq!(&env.payload[..], &i.to_le_bytes());
    }
    let _client = sender.await.unwrap();
}

#[tokio::test]
async fn test_messages_flow_both_ways() {
    let (server, client) = connected(fast_config()).await;

    client
        .send_message(&Envelope::new(1, "ping", "from client"))
        .await
        .unwrap();
    server
        .send_message(&Envelope::new(2, "pong", "from server"))
        .await
        .unwrap();

    assert_eq!(server.recv_message().await.unwrap().tag_str(), Some("ping"));
    let reply = client.recv_message().await.unwrap();
    assert_eq!(reply.id, 2);
    assert_eq!(&reply.payload[..], b"from server");
}

#[tokio::test]
async fn test_two_sided_send_copies_region() {
    let src = HostBuffer::pattern(512, 3);
    let server = session(fast_config());
    let client = session(fast_config());
    let index = register(&client, &src);
    connect_pair(&server, &client).await;

    let id = client.send(index, 512, "kv-block").await.unwrap();
    let env = server.recv_message().await.unwrap();
    assert_eq!(env.id, id);
    assert_eq!(env.tag_str(), Some("kv-block"));
    assert_eq!(env.length, 512);
    assert_eq!(env.payload.to_vec(), src.to_vec());

    // A prefix of the region.
    let id = client.send(index, 100, "kv-head").await.unwrap();
    let env = server.recv_message().await.unwrap();
    assert_eq!(env.id, id);
    assert_eq!(env.payload.to_vec(), src.to_vec()[..100].to_vec());
}

#[tokio::test]
async fn test_send_rejects_bad_local_region() {
    let src = HostBuffer::pattern(64, 1);
    let server = session(fast_config());
    let client = session(fast_config());
    register(&client, &src);
    connect_pair(&server, &client).await;

    assert!(matches!(
        client.send(0, 65, "too-long").await,
        Err(TransportError::Operation { op: OpKind::Send, .. })
    ));
    assert!(matches!(
        client.send(3, 8, "missing").await,
        Err(TransportError::Operation { op: OpKind::Send, .. })
    ));
    assert_eq!(client.state(), ConnectionState::Established);
}

#[tokio::test]
async fn test_one_sided_send_writes_then_notifies() {
    let src = HostBuffer::pattern(256, 7);
    let dst = HostBuffer::zeroed(256);
    let server = session(fast_config());
    let client = session(TransportConfig {
        send_mode: SendMode::OneSided,
        ..fast_config()
    });
    register(&server, &dst);
    register(&client, &src);
    connect_pair(&server, &client).await;

    let id = client.send(0, 256, "layer-3").await.unwrap();
    let env = server.recv_message().await.unwrap();
    assert_eq!(env.id, id);
    assert_eq!(env.kind, EnvelopeKind::WriteNotice { region: 0 });
    assert_eq!(env.length, 256);
    assert!(env.payload.is_empty());
    assert_eq!(env.tag_str(), Some("layer-3"));
    // The write completed before the notice was posted.
    assert_eq!(dst.to_vec(), src.to_vec());
}

#[tokio::test]
async fn test_notify_sends_empty_envelope() {
    let (server, client) = connected(fast_config()).await;

    let first = client.notify("req-42").await.unwrap();
    let second = client.notify("req-43").await.unwrap();
    assert!(second > first);

    let env = server.recv_message().await.unwrap();
    assert_eq!(env.id, first);
    assert_eq!(env.tag_str(), Some("req-42"));
    assert_eq!(env.length, 0);
    assert!(env.payload.is_empty());
    assert_eq!(server.recv_message().await.unwrap().id, second);
}

#[tokio::test]
async fn test_sender_waits_for_receive_credit() {
    let (server, client) = connected(shallow_config(2)).await;

    client.send_message(&Envelope::new(1, "a", "1")).await.unwrap();
    client.send_message(&Envelope::new(2, "b", "2")).await.unwrap();

    // Window exhausted: the third send cannot be posted yet.
    let blocked = tokio::time::timeout(
        Duration::from_millis(200),
        client.send_message(&Envelope::new(3, "c", "3")),
    )
    .await;
    assert!(blocked.is_err(), "third send should wait for credit");

    let third = {
        let client = client.clone();
        tokio::spawn(async move { client.send_message(&Envelope::new(3, "c", "3")).await })
    };

    assert_eq!(server.recv_message().await.unwrap().id, 1);
    tokio::time::timeout(Duration::from_secs(5), third)
        .await
        .expect("credit never returned")
        .unwrap()
        .unwrap();
    assert_eq!(server.recv_message().await.unwrap().id, 2);
    assert_eq!(server.recv_message().await.unwrap().id, 3);
}

#[tokio::test]
async fn test_oversized_message_is_rejected() {
    let (server, client) = connected(TransportConfig {
        max_message_bytes: 1024,
        ..fast_config()
    })
    .await;

    let err = client
        .send_message(&Envelope::new(7, "big", vec![0u8; 4096]))
        .await
        .unwrap_err();
    assert!(
        matches!(err, TransportError::Operation { op: OpKind::Send, .. }),
        "got {err}"
    );

    // Only that message failed.
    client
        .send_message(&Envelope::new(8, "small", "ok"))
        .await
        .unwrap();
    assert_eq!(server.recv_message().await.unwrap().id, 8);
}

#[tokio::test]
async fn test_inconsistent_envelope_is_rejected() {
    let (_server, client) = connected(fast_config()).await;

    let mut env = Envelope::new(1, "t", "abc");
    env.length = 99;
    assert!(matches!(
        client.send_message(&env).await,
        Err(TransportError::Operation { op: OpKind::Send, .. })
    ));
}

#[tokio::test]
async fn test_smaller_peer_limit_caps_outgoing_messages() {
    let server = session(TransportConfig {
        max_message_bytes: 1024,
        ..fast_config()
    });
    let client = session(TransportConfig {
        max_message_bytes: 64 * 1024,
        ..fast_config()
    });
    connect_pair(&server, &client).await;

    // Fits the client's own limit but not the server's receive slots.
    let err = client
        .send_message(&Envelope::new(1, "big", vec![7u8; 4096]))
        .await
        .unwrap_err();
    assert!(
        matches!(err, TransportError::Operation { op: OpKind::Send, .. }),
        "got {err}"
    );
    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(server.state(), ConnectionState::Established);

    client
        .send_message(&Envelope::new(2, "small", vec![7u8; 512]))
        .await
        .unwrap();
    assert_eq!(server.recv_message().await.unwrap().id, 2);
}

#[tokio::test]
async fn test_completed_tags_are_remembered_then_evicted() {
    let (server, client) = connected(TransportConfig {
        completion_history: 2,
        ..fast_config()
    })
    .await;

    for tag in ["req-1", "req-2", "req-3"] {
        client.notify(tag).await.unwrap();
    }
    assert!(!client.is_complete("req-1"));
    assert!(client.is_complete("req-2"));
    assert!(client.is_complete("req-3"));

    assert!(!server.is_complete("req-1"));
    assert_eq!(server.recv_message().await.unwrap().tag_str(), Some("req-1"));
    assert!(server.is_complete("req-1"));
    server.recv_message().await.unwrap();
    server.recv_message().await.unwrap();
    assert!(!server.is_complete("req-1"));
    assert!(server.is_complete("req-3"));
    assert!(!server.is_complete("req-4"));
}
