//! Fabric providers: memory registration, queue pairs and completion queues.
//!
//! A provider is driven in three phases:
//! 1. `Fabric::prepare()` creates a queue pair and returns its local endpoint.
//! 2. The endpoint blobs are swapped over the control channel.
//! 3. `PreparedQueuePair::complete()` connects to the remote endpoint and
//!    yields a `QueuePair` plus the receiving end of its completion queue.

pub mod soft;
#[cfg(feature = "verbs")]
pub mod verbs;
#[cfg(feature = "gpudirect")]
pub mod cuda;

use crate::config::{FabricKind, TransportConfig};
use crate::error::Result;
use crate::types::Role;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Keys for a span registered with a fabric.
///
/// Dropping the value deregisters the span.
pub trait RegisteredMemory: Send + Sync {
    fn lkey(&self) -> u32;
    fn rkey(&self) -> u32;
}

/// A protection domain able to register memory and create queue pairs.
pub trait Fabric: Send + Sync {
    fn kind(&self) -> FabricKind;

    fn name(&self) -> &'static str;

    /// Register `[addr, addr + len)` for local and remote access.
    ///
    /// # Safety
    ///
    /// The span must stay valid (allocated, and not freed or moved) for as long
    /// as the returned handle is alive. Remote peers may read and write it at
    /// any time while registered.
    unsafe fn register(&self, addr: u64, len: u64) -> Result<Box<dyn RegisteredMemory>>;

    /// Create a queue pair for one peer.
    ///
    /// `local` and `peer` are the control channel's socket addresses.
    fn prepare<'a>(
        &'a self,
        role: Role,
        local: SocketAddr,
        peer: SocketAddr,
        params: QueueParams,
    ) -> BoxFuture<'a, Result<Box<dyn PreparedQueuePair>>>;
}

/// Sizing for a queue pair.
#[derive(Debug, Clone, Copy)]
pub struct QueueParams {
    /// Two-sided messages the peer may have outstanding toward us.
    pub recv_depth: u32,
    /// Largest two-sided message body.
    pub max_message_bytes: usize,
}

/// Room in a receive buffer beyond `max_message_bytes` for the frame type
/// and envelope header.
const FRAME_SLACK: usize = 64;

impl QueueParams {
    /// Largest inbound two-sided frame this queue pair accepts.
    pub fn max_frame_bytes(&self) -> usize {
        self.max_message_bytes.saturating_add(FRAME_SLACK)
    }
}

/// A queue pair that has not yet been connected to its peer.
pub trait PreparedQueuePair: Send {
    /// Opaque endpoint blob to hand to the peer.
    fn endpoint(&self) -> Bytes;

    /// Connect to the peer described by `remote`.
    fn complete(
        self: Box<Self>,
        remote: Bytes,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<ConnectedQueuePair>>;
}

/// A connected queue pair and its completion stream.
pub struct ConnectedQueuePair {
    pub qp: Box<dyn QueuePair>,
    pub completions: mpsc::UnboundedReceiver<CompletionEvent>,
}

/// A reliable-connected queue pair.
pub trait QueuePair: Send + Sync {
    /// Post a work request. Its result arrives later as a `CompletionEvent`.
    ///
    /// An `Err` means the request was never posted and no completion will be
    /// generated for it.
    fn post(&self, wr: WorkRequest) -> Result<()>;

    /// How many SENDs may be outstanding at once, if the queue pair stages
    /// them in a fixed pool. `None` means unbounded.
    fn send_slots(&self) -> Option<usize> {
        None
    }

    /// Tear down the queue pair. Idempotent. Closes the completion stream.
    fn disconnect(&self);
}

/// Local scatter/gather entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSge {
    pub addr: u64,
    pub length: u64,
    pub lkey: u32,
}

/// Remote target of a one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSge {
    pub addr: u64,
    pub rkey: u32,
}

#[derive(Debug, Clone)]
pub enum WorkRequest {
    /// Copy `local` into peer memory at `remote`.
    Write {
        wr_id: u64,
        local: LocalSge,
        remote: RemoteSge,
    },
    /// Copy peer memory at `remote` into `local`.
    Read {
        wr_id: u64,
        local: LocalSge,
        remote: RemoteSge,
    },
    /// Deliver `inline` followed by the bytes of `gather` to the peer's
    /// receive queue as one message.
    Send {
        wr_id: u64,
        inline: Bytes,
        gather: Option<LocalSge>,
    },
}

impl WorkRequest {
    pub fn wr_id(&self) -> u64 {
        match self {
            WorkRequest::Write { wr_id, .. }
            | WorkRequest::Read { wr_id, .. }
            | WorkRequest::Send { wr_id, .. } => *wr_id,
        }
    }
}

/// Outcome of a single work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    /// Remote key or bounds rejected by the peer.
    RemoteAccess,
    /// Local key or bounds rejected.
    LocalAccess,
    /// Request flushed because the queue pair went down.
    Flushed,
    Failed(String),
}

impl WcStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, WcStatus::Success)
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WcStatus::Success => f.write_str("success"),
            WcStatus::RemoteAccess => f.write_str("remote access error"),
            WcStatus::LocalAccess => f.write_str("local protection error"),
            WcStatus::Flushed => f.write_str("work request flushed"),
            WcStatus::Failed(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
}

/// Entry on a queue pair's completion stream.
#[derive(Debug)]
pub enum CompletionEvent {
    /// A posted request finished.
    Work(WorkCompletion),
    /// A two-sided message arrived.
    Recv(Bytes),
    /// The queue pair is unusable. No further events follow.
    Fatal(String),
}

/// Open the provider selected by `config`.
pub fn open(config: &TransportConfig) -> Result<Arc<dyn Fabric>> {
    match config.fabric {
        FabricKind::Soft => Ok(Arc::new(soft::SoftFabric::new())),
        #[cfg(feature = "verbs")]
        FabricKind::Verbs { device_index } => Ok(Arc::new(verbs::VerbsFabric::open(
            device_index,
            config.gpu_ordinal,
        )?)),
        #[cfg(not(feature = "verbs"))]
        FabricKind::Verbs { .. } => Err(crate::error::TransportError::fabric(
            "verbs fabric requested but tensorlink was built without the `verbs` feature",
        )),
    }
}
