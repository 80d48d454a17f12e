use super::helpers::*;
use tensorlink::{ConnectionState, OpKind, RegionSlice, TransportError};

#[tokio::test]
async fn test_write_whole_region() {
    let dst = HostBuffer::zeroed(4096);
    let src = HostBuffer::pattern(4096, 11);
    let server = session(fast_config());
    let client = session(fast_config());
    register(&server, &dst);
    register(&client, &src);
    connect_pair(&server, &client).await;

    client.write(0usize, 0usize).await.unwrap();
    assert_eq!(dst.to_vec(), src.to_vec());
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_recv_pulls_remote_region() {
    let remote = HostBuffer::pattern(8192, 5);
    let local = HostBuffer::zeroed(8192);
    let server = session(fast_config());
    let client = session(fast_config());
    register(&server, &remote);
    register(&client, &local);
    connect_pair(&server, &client).await;

    client.recv(0usize, 0usize).await.unwrap();
    assert_eq!(local.to_vec(), remote.to_vec());
}

#[tokio::test]
async fn test_server_can_write_into_client() {
    let client_mem = HostBuffer::zeroed(128);
    let server_mem = HostBuffer::pattern(128, 9);
    let server = session(fast_config());
    let client = session(fast_config());
    register(&server, &server_mem);
    register(&client, &client_mem);
    connect_pair(&server, &client).await;

    server.write(0usize, 0usize).await.unwrap();
    assert_eq!(client_mem.to_vec(), server_mem.to_vec());
}

#[tokio::test]
async fn test_sub_range_write_and_read() {
    let dst = HostBuffer::zeroed(256);
    let src = HostBuffer::pattern(256, 21);
    let server = session(fast_config());
    let client = session(fast_config());
    register(&server, &dst);
    register(&client, &src);
    connect_pair(&server, &client).await;

    client
        .write(RegionSlice::range(0, 16, 32), RegionSlice::range(0, 100, 32))
        .await
        .unwrap();
    let got = dst.to_vec();
    assert_eq!(&got[100..132], &src.to_vec()[16..48]);
    assert!(got[..100].iter().all(|&b| b == 0));
    assert!(got[132..].iter().all(|&b| b == 0));

    // Pull those 32 bytes back over the start of the source.
    client
        .read(RegionSlice::range(0, 0, 32), RegionSlice::range(0, 100, 32))
        .await
        .unwrap();
    assert_eq!(&src.to_vec()[..32], &got[100..132]);
}

#[tokio::test]
async fn test_registration_offset_is_honoured() {
    let dst = HostBuffer::zeroed(64);
    let src = HostBuffer::pattern(64, 2);
    let server = session(fast_config());
    let client = session(fast_config());
    // Expose only the second half of the server buffer.
    unsafe { server.register_buffer(dst.addr(), 32, 32).unwrap() };
    unsafe { client.register_buffer(src.addr(), 32, 32).unwrap() };
    let (remote, _) = connect_pair(&server, &client).await;
    assert_eq!(remote.get(0).unwrap().offset, 32);

    client.write(0usize, 0usize).await.unwrap();
    let got = dst.to_vec();
    assert!(got[..32].iter().all(|&b| b == 0));
    assert_eq!(&got[32..], &src.to_vec()[32..]);
}

#[tokio::test]
async fn test_bad_remote_index_fails_only_that_op() {
    let dst = HostBuffer::zeroed(64);
    let src = HostBuffer::pattern(64, 4);
    let server = session(fast_config());
    let client = session(fast_config());
    register(&server, &dst);
    register(&client, &src);
    connect_pair(&server, &client).await;

    let err = client.write(0usize, 5usize).await.unwrap_err();
    assert!(
        matches!(err, TransportError::Operation { op: OpKind::Write, .. }),
        "got {err}"
    );
    assert_eq!(client.state(), ConnectionState::Established);

    client.write(0usize, 0usize).await.unwrap();
    assert_eq!(dst.to_vec(), src.to_vec());
}

#[tokio::test]
async fn test_length_and_bounds_checks() {
    let dst = HostBuffer::zeroed(128);
    let src = HostBuffer::pattern(64, 8);
    let server = session(fast_config());
    let client = session(fast_config());
    register(&server, &dst);
    register(&client, &src);
    connect_pair(&server, &client).await;

    // Whole regions of different sizes.
    assert!(matches!(
        client.post_write(0usize, 0usize),
        Err(TransportError::Operation { op: OpKind::Write, .. })
    ));
    // Explicit lengths that disagree.
    assert!(matches!(
        client.post_read(RegionSlice::range(0, 0, 16), RegionSlice::range(0, 0, 32)),
        Err(TransportError::Operation { op: OpKind::Read, .. })
    ));
    // Runs past the end of the remote region.
    assert!(matches!(
        client.post_write(RegionSlice::range(0, 0, 64), RegionSlice::range(0, 100, 64)),
        Err(TransportError::Operation { op: OpKind::Write, .. })
    ));
    // Zero bytes.
    assert!(matches!(
        client.post_write(RegionSlice::range(0, 0, 0), RegionSlice::range(0, 0, 0)),
        Err(TransportError::Operation { .. })
    ));

    // Explicit length on one side only is fine.
    client
        .write(RegionSlice::whole(0), RegionSlice::range(0, 64, 64))
        .await
        .unwrap();
    assert_eq!(&dst.to_vec()[64..], &src.to_vec()[..]);
    assert_eq!(client.state(), ConnectionState::Established);
}

#[tokio::test]
async fn test_unregister_is_idempotent() {
    let dst = HostBuffer::zeroed(64);
    let src = HostBuffer::pattern(64, 6);
    let server = session(fast_config());
    let client = session(fast_config());
    register(&server, &dst);
    let index = register(&client, &src);
    connect_pair(&server, &client).await;

    assert!(client.unregister(index));
    assert!(!client.unregister(index));
    assert!(!client.unregister(99));
    assert_eq!(client.connection_info().local_regions, 0);
    // The index stays in the BufferSet.
    assert_eq!(client.local_buffers().len(), 1);

    assert!(matches!(
        client.write(index, 0usize).await,
        Err(TransportError::Operation { op: OpKind::Write, .. })
    ));
    assert_eq!(client.state(), ConnectionState::Established);
}

#[tokio::test]
async fn test_peer_unregistered_region_fails_only_that_op() {
    let gone = HostBuffer::zeroed(64);
    let kept = HostBuffer::zeroed(64);
    let src = HostBuffer::pattern(64, 12);
    let server = session(fast_config());
    let client = session(fast_config());
    register(&server, &gone);
    register(&server, &kept);
    register(&client, &src);
    connect_pair(&server, &client).await;

    assert!(server.unregister(0));

    let err = client.write(0usize, 0usize).await.unwrap_err();
    assert!(
        matches!(err, TransportError::Operation { op: OpKind::Write, .. }),
        "got {err}"
    );
    assert!(matches!(
        client.read(0usize, 0usize).await,
        Err(TransportError::Operation { op: OpKind::Read, .. })
    ));
    assert!(gone.to_vec().iter().all(|&b| b == 0));

    client.write(0usize, 1usize).await.unwrap();
    assert_eq!(kept.to_vec(), src.to_vec());
    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(server.state(), ConnectionState::Established);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes() {
    const CHUNK: u64 = 4096;
    const CHUNKS: u64 = 16;
    let dst = HostBuffer::zeroed((CHUNK * CHUNKS) as usize);
    let src = HostBuffer::pattern((CHUNK * CHUNKS) as usize, 13);
    let server = session(fast_config());
    let client = session(fast_config());
    register(&server, &dst);
    register(&client, &src);
    connect_pair(&server, &client).await;

    let ops: Vec<_> = (0..CHUNKS)
        .map(|i| {
            let slice = RegionSlice::range(0, i * CHUNK, CHUNK);
            client.post_write(slice, slice).unwrap()
        })
        .collect();
    for op in ops {
        assert_eq!(op.kind(), OpKind::Write);
        op.await.unwrap();
    }
    assert_eq!(dst.to_vec(), src.to_vec());
    assert_eq!(client.in_flight(), 0);
}
