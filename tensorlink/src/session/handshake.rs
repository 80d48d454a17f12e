//! Connection-open handshake on the control channel.
//!
//! ```text
//! server                         client
//!   | ---- Hello(buffers, ep) ---> |
//!   | <--- Hello(buffers, ep) ---- |   both sides connect their queue pair
//!   | ---- Ready ----------------> |
//! ```
//!
//! A server that already has a peer answers with `Reject` instead of its
//! Hello.

use super::SessionInner;
use crate::error::{Result, TransportError};
use crate::fabric::{ConnectedQueuePair, QueueParams};
use crate::memory::BufferSet;
use crate::protocol::{ControlFrame, Hello};
use crate::transport::{ControlChannel, control_connect};
use crate::types::{ConnectionState, PROTOCOL_VERSION, Role};
use std::net::SocketAddr;

/// Everything a completed handshake hands over to the session.
pub(super) struct Handshaken {
    pub role: Role,
    pub channel: ControlChannel,
    pub remote_buffers: BufferSet,
    pub peer_recv_depth: u32,
    /// Message limit both sides accept: the smaller of the two advertised.
    pub message_limit: usize,
    pub conn: ConnectedQueuePair,
}

fn queue_params(inner: &SessionInner) -> QueueParams {
    QueueParams {
        recv_depth: inner.config.recv_queue_depth,
        max_message_bytes: inner.config.max_message_bytes,
    }
}

fn local_hello(inner: &SessionInner, endpoint: bytes::Bytes) -> ControlFrame {
    ControlFrame::Hello(Hello {
        version: PROTOCOL_VERSION,
        fabric: inner.fabric.kind().wire_id(),
        recv_depth: inner.config.recv_queue_depth,
        max_message_bytes: u32::try_from(inner.config.max_message_bytes).unwrap_or(u32::MAX),
        endpoint,
        buffers: inner.registry.buffers(),
    })
}

fn check_compatible(inner: &SessionInner, peer: &Hello) -> Result<()> {
    if peer.version != PROTOCOL_VERSION {
        return Err(TransportError::Protocol(format!(
            "protocol version mismatch: local {PROTOCOL_VERSION}, remote {}",
            peer.version
        )));
    }
    let fabric = inner.fabric.kind().wire_id();
    if peer.fabric != fabric {
        return Err(TransportError::Protocol(format!(
            "fabric mismatch: local {} ({fabric}), remote {}",
            inner.fabric.name(),
            peer.fabric
        )));
    }
    if peer.recv_depth == 0 {
        return Err(TransportError::Protocol(
            "peer advertised a zero receive depth".into(),
        ));
    }
    Ok(())
}

/// The peer sizes its receive buffers by its own limit, so neither side may
/// send more than the smaller one.
fn message_limit(inner: &SessionInner, peer: &Hello) -> usize {
    inner
        .config
        .max_message_bytes
        .min(peer.max_message_bytes as usize)
}

/// Failures while opening a connection surface as `Connect`, except the
/// ones with a dedicated meaning.
pub(super) fn as_connect_error(addr: SocketAddr, e: TransportError) -> TransportError {
    match e {
        TransportError::Connect { .. }
        | TransportError::AlreadyConnected
        | TransportError::ConnectionClosed => e,
        other => TransportError::connect(addr, other.to_string()),
    }
}

/// Client side: dial `remote` and run the handshake.
pub(super) async fn client(inner: &SessionInner, remote: SocketAddr) -> Result<Handshaken> {
    let timeout = inner.config.connect_timeout;
    let mut channel = control_connect(remote, timeout).await?;
    if !inner
        .state
        .advance_from(ConnectionState::Connecting, ConnectionState::Handshaking)
    {
        return Err(TransportError::ConnectionClosed);
    }

    let server = match channel.recv().await? {
        ControlFrame::Hello(hello) => hello,
        ControlFrame::Reject { reason } => {
            tracing::debug!(%remote, reason, "connection rejected");
            return Err(TransportError::AlreadyConnected);
        }
        other => {
            return Err(TransportError::Protocol(format!(
                "expected hello, got {}",
                other.name()
            )));
        }
    };
    check_compatible(inner, &server)?;

    let prepared = inner
        .fabric
        .prepare(
            Role::Client,
            channel.local_addr(),
            channel.peer_addr(),
            queue_params(inner),
        )
        .await?;
    channel.send(&local_hello(inner, prepared.endpoint())).await?;
    let conn = prepared.complete(server.endpoint.clone(), timeout).await?;

    match channel.recv().await? {
        ControlFrame::Ready => {}
        other => {
            return Err(TransportError::Protocol(format!(
                "expected ready, got {}",
                other.name()
            )));
        }
    }

    tracing::info!(
        %remote,
        remote_regions = server.buffers.len(),
        remote_bytes = server.buffers.total_bytes(),
        "handshake complete (client)"
    );
    let message_limit = message_limit(inner, &server);
    Ok(Handshaken {
        role: Role::Client,
        channel,
        remote_buffers: server.buffers,
        peer_recv_depth: server.recv_depth,
        message_limit,
        conn,
    })
}

/// Server side: run the handshake on an accepted channel.
pub(super) async fn server(inner: &SessionInner, mut channel: ControlChannel) -> Result<Handshaken> {
    let peer = channel.peer_addr();
    let prepared = inner
        .fabric
        .prepare(
            Role::Server,
            channel.local_addr(),
            peer,
            queue_params(inner),
        )
        .await?;
    channel.send(&local_hello(inner, prepared.endpoint())).await?;

    let client = match channel.recv().await? {
        ControlFrame::Hello(hello) => hello,
        other => {
            return Err(TransportError::Protocol(format!(
                "expected hello, got {}",
                other.name()
            )));
        }
    };
    check_compatible(inner, &client)?;

    let conn = prepared
        .complete(client.endpoint.clone(), inner.config.connect_timeout)
        .await?;
    channel.send(&ControlFrame::Ready).await?;

    tracing::info!(
        %peer,
        remote_regions = client.buffers.len(),
        remote_bytes = client.buffers.total_bytes(),
        "handshake complete (server)"
    );
    let message_limit = message_limit(inner, &client);
    Ok(Handshaken {
        role: Role::Server,
        channel,
        remote_buffers: client.buffers,
        peer_recv_depth: client.recv_depth,
        message_limit,
        conn,
    })
}

/// Turn away a connection attempt while a peer is attached.
pub(super) async fn reject(mut channel: ControlChannel, state: ConnectionState) {
    let peer = channel.peer_addr();
    let reason = match state {
        ConnectionState::Closing | ConnectionState::Closed => "session closed",
        _ => "already connected",
    };
    tracing::info!(%peer, %state, "rejecting connection: {reason}");
    if let Err(e) = channel
        .send(&ControlFrame::Reject {
            reason: reason.to_string(),
        })
        .await
    {
        tracing::debug!(%peer, "reject not delivered: {e}");
    }
}
