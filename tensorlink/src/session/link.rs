//! A session's attachment to its one peer.

use super::SessionInner;
use crate::engine::DataChannel;
use crate::error::TransportError;
use crate::memory::BufferSet;
use crate::protocol::ControlFrame;
use crate::transport::{ControlReader, ControlWriter};
use crate::types::Role;
use std::net::SocketAddr;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::Mutex;

pub(crate) struct Link {
    pub role: Role,
    pub local_control: SocketAddr,
    pub peer_control: SocketAddr,
    pub remote_buffers: BufferSet,
    pub data: DataChannel,
    control_tx: Mutex<ControlWriter>,
}

impl Link {
    pub fn new(
        role: Role,
        local_control: SocketAddr,
        peer_control: SocketAddr,
        remote_buffers: BufferSet,
        data: DataChannel,
        control_tx: ControlWriter,
    ) -> Self {
        Self {
            role,
            local_control,
            peer_control,
            remote_buffers,
            data,
            control_tx: Mutex::new(control_tx),
        }
    }

    /// Tell the peer we are closing. Best effort, bounded by `timeout`.
    pub async fn send_close(&self, timeout: Duration) {
        let send = async {
            let mut tx = self.control_tx.lock().await;
            tx.send(&ControlFrame::Close).await
        };
        match tokio::time::timeout(timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(peer = %self.peer_control, "close notice failed: {e}"),
            Err(_) => tracing::warn!(peer = %self.peer_control, "close notice timed out"),
        }
    }
}

/// Watches the control channel after the handshake. A `Close` from the peer
/// or the channel dropping starts a graceful teardown.
pub(super) async fn control_loop(mut reader: ControlReader, session: Weak<SessionInner>) {
    let reason = loop {
        match reader.recv().await {
            Ok(ControlFrame::Close) => break "peer closed the connection".to_string(),
            Ok(other) => {
                tracing::warn!(frame = other.name(), "unexpected control frame after handshake");
            }
            Err(e) => break control_error_reason(e),
        }
    };
    tracing::debug!("control loop ended: {reason}");
    if let Some(inner) = session.upgrade() {
        inner.peer_closed(reason).await;
    }
}

fn control_error_reason(e: TransportError) -> String {
    match e {
        TransportError::ConnectionLost(r) => r,
        other => format!("control channel failed: {other}"),
    }
}
