//! Data path: posts work requests and harvests their completions.

use super::completion::{PendingOperation, PendingTable};
use crate::error::{Result, TransportError};
use crate::fabric::{
    CompletionEvent, ConnectedQueuePair, LocalSge, QueuePair, RemoteSge, WorkRequest,
};
use crate::memory::Registration;
use crate::protocol::envelope::DataFrame;
use crate::protocol::Envelope;
use crate::types::OpKind;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;

/// wr_ids with this bit set are untracked internal sends (credit returns).
const CONTROL_WR_BIT: u64 = 1 << 63;

#[derive(Debug, Clone, Copy)]
pub struct DataChannelParams {
    /// Credits the peer advertised: how many of our messages it can buffer.
    pub peer_recv_depth: u32,
    /// Credits we advertised.
    pub local_recv_depth: u32,
    pub operation_timeout: Duration,
    pub max_message_bytes: usize,
}

/// Receive credits we owe the peer.
///
/// At most one credit frame is on the wire at a time, so it always finds the
/// send slot held back for it. Credits whose frame could not be posted stay
/// owed and go out with the next one.
struct CreditReturn {
    /// Messages consumed and not yet credited back.
    owed: AtomicU32,
    batch: u32,
    seq: AtomicU64,
    in_flight: AtomicBool,
}

impl CreditReturn {
    fn new(local_recv_depth: u32) -> Self {
        Self {
            owed: AtomicU32::new(0),
            batch: (local_recv_depth / 2).max(1),
            seq: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
        }
    }

    fn consumed(&self, qp: &dyn QueuePair) {
        self.owed.fetch_add(1, Ordering::AcqRel);
        self.flush(qp, self.batch);
    }

    /// The previous credit frame completed; send whatever piled up meanwhile.
    fn frame_done(&self, qp: &dyn QueuePair) {
        self.in_flight.store(false, Ordering::Release);
        self.flush(qp, 1);
    }

    fn flush(&self, qp: &dyn QueuePair, threshold: u32) {
        if self.owed.load(Ordering::Acquire) < threshold {
            return;
        }
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        let n = self.owed.swap(0, Ordering::AcqRel);
        if n == 0 {
            self.in_flight.store(false, Ordering::Release);
            return;
        }
        let wr = WorkRequest::Send {
            wr_id: CONTROL_WR_BIT | self.seq.fetch_add(1, Ordering::Relaxed),
            inline: DataFrame::credit(n),
            gather: None,
        };
        if let Err(e) = qp.post(wr) {
            self.owed.fetch_add(n, Ordering::AcqRel);
            self.in_flight.store(false, Ordering::Release);
            tracing::debug!("credit return of {n} deferred: {e}");
        }
    }
}

/// An established queue pair plus the engine that resolves its operations.
///
/// A background harvest task drains the completion queue: work completions
/// resolve their `PendingOperation`, inbound messages are queued for
/// `recv_envelope`, and credit frames refill the send window. A fatal event
/// fails every pending op with `ConnectionLost` and reports to `on_fatal`.
///
/// Two windows gate a message: a receive credit from the peer, and a local
/// send slot when the queue pair stages sends in a fixed pool. One slot is
/// kept back for credit frames.
pub struct DataChannel {
    qp: Arc<dyn QueuePair>,
    pending: Arc<PendingTable>,
    credits: Arc<Semaphore>,
    send_slots: Arc<Semaphore>,
    inbound: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    credit_return: Arc<CreditReturn>,
    params: DataChannelParams,
    harvest: JoinHandle<()>,
}

impl DataChannel {
    pub fn start(
        conn: ConnectedQueuePair,
        params: DataChannelParams,
        on_fatal: impl FnOnce(String) + Send + 'static,
    ) -> Self {
        let qp: Arc<dyn QueuePair> = Arc::from(conn.qp);
        let pending = Arc::new(PendingTable::new());
        let credits = Arc::new(Semaphore::new(params.peer_recv_depth as usize));
        let slots = qp
            .send_slots()
            .map_or(Semaphore::MAX_PERMITS, |n| n.saturating_sub(1).max(1));
        let send_slots = Arc::new(Semaphore::new(slots));
        let credit_return = Arc::new(CreditReturn::new(params.local_recv_depth));
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let harvest = tokio::spawn(harvest_loop(
            conn.completions,
            Harvest {
                qp: Arc::clone(&qp),
                pending: Arc::clone(&pending),
                credits: Arc::clone(&credits),
                send_slots: Arc::clone(&send_slots),
                credit_return: Arc::clone(&credit_return),
                max_credits: params.peer_recv_depth,
            },
            in_tx,
            on_fatal,
        ));

        Self {
            qp,
            pending,
            credits,
            send_slots,
            inbound: Mutex::new(in_rx),
            credit_return,
            params,
            harvest,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Wait until no operation is in flight.
    pub async fn wait_idle(&self) {
        self.pending.wait_idle().await
    }

    fn post_tracked(
        &self,
        kind: OpKind,
        pins: Vec<Arc<Registration>>,
        slot: Option<OwnedSemaphorePermit>,
        build: impl FnOnce(u64) -> WorkRequest,
    ) -> Result<PendingOperation> {
        let (wr_id, rx) = self.pending.insert_holding(kind, pins, slot)?;
        if let Err(e) = self.qp.post(build(wr_id)) {
            self.pending.remove(wr_id);
            return Err(e);
        }
        Ok(PendingOperation::new(
            wr_id,
            kind,
            rx,
            Arc::clone(&self.pending),
            self.params.operation_timeout,
        ))
    }

    /// Post a one-sided write of `local` into peer memory at `remote`.
    pub fn post_write(
        &self,
        local: LocalSge,
        remote: RemoteSge,
        pins: Vec<Arc<Registration>>,
    ) -> Result<PendingOperation> {
        tracing::debug!(
            len = local.length,
            raddr = remote.addr,
            "post write"
        );
        self.post_tracked(OpKind::Write, pins, None, |wr_id| WorkRequest::Write {
            wr_id,
            local,
            remote,
        })
    }

    /// Post a one-sided read of peer memory at `remote` into `local`.
    pub fn post_read(
        &self,
        local: LocalSge,
        remote: RemoteSge,
        pins: Vec<Arc<Registration>>,
    ) -> Result<PendingOperation> {
        tracing::debug!(
            len = local.length,
            raddr = remote.addr,
            "post read"
        );
        self.post_tracked(OpKind::Read, pins, None, |wr_id| WorkRequest::Read {
            wr_id,
            local,
            remote,
        })
    }

    /// Post a two-sided message: `prefix` (an encoded envelope header and
    /// tag) followed by `gather` if given.
    ///
    /// Suspends while the peer has no receive credit left or every send slot
    /// is taken.
    pub async fn post_message(
        &self,
        prefix: Bytes,
        gather: Option<(LocalSge, Arc<Registration>)>,
    ) -> Result<PendingOperation> {
        let body_len = prefix.len() as u64 + gather.as_ref().map_or(0, |(sge, _)| sge.length);
        if body_len > self.params.max_message_bytes as u64 + Self::FRAME_OVERHEAD {
            return Err(TransportError::operation(
                OpKind::Send,
                format!(
                    "message of {body_len} bytes exceeds the {} byte limit",
                    self.params.max_message_bytes
                ),
            ));
        }

        let credit = self.credits.acquire().await.map_err(|_| {
            TransportError::ConnectionLost("data channel closed while waiting for credit".into())
        })?;
        let slot = Arc::clone(&self.send_slots)
            .acquire_owned()
            .await
            .map_err(|_| {
                TransportError::ConnectionLost(
                    "data channel closed while waiting for a send slot".into(),
                )
            })?;

        let (sge, pins) = match gather {
            Some((sge, pin)) => (Some(sge), vec![pin]),
            None => (None, Vec::new()),
        };
        let op = self.post_tracked(OpKind::Send, pins, Some(slot), |wr_id| WorkRequest::Send {
            wr_id,
            inline: prefix,
            gather: sge,
        })?;
        // Consumed by the peer; it is handed back through a credit frame.
        credit.forget();
        Ok(op)
    }

    /// Frame type byte plus the fixed envelope header.
    const FRAME_OVERHEAD: u64 = 1 + crate::protocol::ENVELOPE_HEADER_SIZE as u64;

    /// Next inbound envelope, or `None` once the connection is gone and
    /// everything that arrived before has been consumed.
    pub async fn recv_envelope(&self) -> Option<Envelope> {
        let env = self.inbound.lock().await.recv().await?;
        self.credit_return.consumed(&*self.qp);
        Some(env)
    }

    /// Cancel everything in flight and tear down the queue pair.
    pub fn close(&self, reason: &str) -> usize {
        let cancelled = self.pending.drain_all(reason);
        self.credits.close();
        self.send_slots.close();
        self.qp.disconnect();
        cancelled
    }
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        self.harvest.abort();
        self.qp.disconnect();
    }
}

/// What the harvest task shares with its `DataChannel`.
struct Harvest {
    qp: Arc<dyn QueuePair>,
    pending: Arc<PendingTable>,
    credits: Arc<Semaphore>,
    send_slots: Arc<Semaphore>,
    credit_return: Arc<CreditReturn>,
    max_credits: u32,
}

async fn harvest_loop(
    mut cq: mpsc::UnboundedReceiver<CompletionEvent>,
    shared: Harvest,
    inbound: mpsc::UnboundedSender<Envelope>,
    on_fatal: impl FnOnce(String),
) {
    let Harvest {
        qp,
        pending,
        credits,
        send_slots,
        credit_return,
        max_credits,
    } = shared;
    let reason = loop {
        let Some(event) = cq.recv().await else {
            break "completion queue closed".to_string();
        };
        match event {
            CompletionEvent::Work(wc) => {
                if wc.wr_id & CONTROL_WR_BIT != 0 {
                    if !wc.status.is_success() {
                        tracing::warn!(status = %wc.status, "credit return failed");
                    }
                    credit_return.frame_done(&*qp);
                    continue;
                }
                let result = if wc.status.is_success() {
                    Ok(())
                } else {
                    let kind = pending.kind_of(wc.wr_id).unwrap_or(OpKind::Send);
                    tracing::debug!(wr_id = wc.wr_id, %kind, status = %wc.status, "operation failed");
                    Err(TransportError::operation(kind, wc.status.to_string()))
                };
                if pending.complete(wc.wr_id, result).is_none() {
                    tracing::debug!(wr_id = wc.wr_id, "completion for expired operation");
                }
            }
            CompletionEvent::Recv(bytes) => match DataFrame::decode(bytes) {
                Ok(DataFrame::Credit(n)) => {
                    let room = (max_credits as usize).saturating_sub(credits.available_permits());
                    credits.add_permits((n as usize).min(room));
                }
                Ok(DataFrame::Envelope(env)) => {
                    let _ = inbound.send(env);
                }
                Err(e) => break format!("malformed message from peer: {e}"),
            },
            CompletionEvent::Fatal(reason) => break reason,
        }
    };
    pending.drain_all(&reason);
    credits.close();
    send_slots.close();
    drop(inbound);
    on_fatal(reason);
}
