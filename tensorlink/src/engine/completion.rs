//! Pending-operation table and the handles callers await.

use crate::error::{Result, TransportError};
use crate::memory::Registration;
use crate::types::OpKind;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, oneshot, watch};

struct PendingEntry {
    kind: OpKind,
    /// `None` once the caller gave up waiting; the entry then lingers until
    /// the fabric reports the work request done.
    tx: Option<oneshot::Sender<Result<()>>>,
    /// Keeps the regions involved registered until the NIC is done with them.
    _pins: Vec<Arc<Registration>>,
    /// Send staging slot, for messages.
    _slot: Option<OwnedSemaphorePermit>,
}

struct Inner {
    next_wr_id: u64,
    ops: HashMap<u64, PendingEntry>,
    /// Set once the table has been drained for good.
    closed: Option<String>,
}

/// Operations posted to the fabric and not yet resolved, keyed by wr_id.
///
/// Each entry resolves exactly once: whoever removes it from the map sends
/// the result.
pub struct PendingTable {
    inner: Mutex<Inner>,
    in_flight: watch::Sender<usize>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                next_wr_id: 1,
                ops: HashMap::new(),
                closed: None,
            }),
            in_flight,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called with `inner` locked so counts are published in order.
    fn publish(&self, n: usize) {
        self.in_flight.send_replace(n);
    }

    /// Reserve a wr_id for a new operation.
    pub fn insert(
        &self,
        kind: OpKind,
        pins: Vec<Arc<Registration>>,
    ) -> Result<(u64, oneshot::Receiver<Result<()>>)> {
        self.insert_holding(kind, pins, None)
    }

    /// Like `insert`, also holding `slot` until the entry leaves the table.
    pub fn insert_holding(
        &self,
        kind: OpKind,
        pins: Vec<Arc<Registration>>,
        slot: Option<OwnedSemaphorePermit>,
    ) -> Result<(u64, oneshot::Receiver<Result<()>>)> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(TransportError::ConnectionLost(reason.clone()));
        }
        let wr_id = inner.next_wr_id;
        inner.next_wr_id += 1;
        inner.ops.insert(
            wr_id,
            PendingEntry {
                kind,
                tx: Some(tx),
                _pins: pins,
                _slot: slot,
            },
        );
        self.publish(inner.ops.len());
        Ok((wr_id, rx))
    }

    /// Resolve `wr_id`. Returns the op kind, or `None` if it already resolved.
    pub fn complete(&self, wr_id: u64, result: Result<()>) -> Option<OpKind> {
        let entry = {
            let mut inner = self.lock();
            let entry = inner.ops.remove(&wr_id)?;
            self.publish(inner.ops.len());
            entry
        };
        let kind = entry.kind;
        match entry.tx {
            // The caller may have stopped waiting.
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => tracing::debug!(wr_id, %kind, "expired operation finally completed"),
        }
        Some(kind)
    }

    /// Stop reporting to the caller of `wr_id` without releasing its pins.
    ///
    /// The work request may still be owned by the NIC, so the entry stays
    /// counted in flight until its completion or a drain removes it.
    pub fn expire(&self, wr_id: u64) -> bool {
        self.lock()
            .ops
            .get_mut(&wr_id)
            .and_then(|e| e.tx.take())
            .is_some()
    }

    /// Drop `wr_id` without resolving it. Used when posting failed and the
    /// caller gets the error directly.
    pub fn remove(&self, wr_id: u64) -> bool {
        let mut inner = self.lock();
        let removed = inner.ops.remove(&wr_id).is_some();
        self.publish(inner.ops.len());
        removed
    }

    /// Kind of a still-pending op.
    pub fn kind_of(&self, wr_id: u64) -> Option<OpKind> {
        self.lock().ops.get(&wr_id).map(|e| e.kind)
    }

    /// Fail every pending op with `ConnectionLost` and refuse new ones.
    /// Returns how many ops were cancelled.
    pub fn drain_all(&self, reason: &str) -> usize {
        let entries: Vec<PendingEntry> = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.to_string());
            }
            let entries = inner.ops.drain().map(|(_, e)| e).collect();
            self.publish(0);
            entries
        };
        let n = entries.len();
        for tx in entries.into_iter().filter_map(|e| e.tx) {
            let _ = tx.send(Err(TransportError::ConnectionLost(reason.to_string())));
        }
        if n > 0 {
            tracing::debug!(cancelled = n, reason, "pending operations drained");
        }
        n
    }

    pub fn len(&self) -> usize {
        *self.in_flight.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until nothing is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Handle to a posted operation.
///
/// Resolves when the fabric confirms completion. Await it directly, or call
/// `wait`.
#[must_use = "an operation's outcome is only observed by awaiting its handle"]
pub struct PendingOperation {
    wr_id: u64,
    kind: OpKind,
    rx: oneshot::Receiver<Result<()>>,
    table: Arc<PendingTable>,
    timeout: Duration,
}

impl PendingOperation {
    pub(crate) fn new(
        wr_id: u64,
        kind: OpKind,
        rx: oneshot::Receiver<Result<()>>,
        table: Arc<PendingTable>,
        timeout: Duration,
    ) -> Self {
        Self {
            wr_id,
            kind,
            rx,
            table,
            timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.wr_id
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Wait for the fabric to complete the operation.
    ///
    /// Fails with `Operation` if this op failed or timed out, and with
    /// `ConnectionLost` if the connection went down first. A timed-out op
    /// keeps its regions pinned until the fabric completes or flushes it.
    pub async fn wait(self) -> Result<()> {
        let mut rx = self.rx;
        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionLost(
                "completion engine stopped".into(),
            )),
            Err(_) => {
                if !self.table.expire(self.wr_id) {
                    // Resolved between the deadline and the expiry.
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                }
                tracing::debug!(wr_id = self.wr_id, kind = %self.kind, "operation timed out");
                Err(TransportError::operation(
                    self.kind,
                    format!("no completion within {:?}", self.timeout),
                ))
            }
        }
    }
}

impl IntoFuture for PendingOperation {
    type Output = Result<()>;
    type IntoFuture = BoxFuture<'static, Result<()>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl std::fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOperation")
            .field("wr_id", &self.wr_id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
