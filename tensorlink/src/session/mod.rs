//! The public transport session: one local BufferSet, at most one peer.

mod completed;
mod handshake;
mod link;

use crate::config::TransportConfig;
use crate::engine::{DataChannel, DataChannelParams, PendingOperation};
use crate::error::{Result, TransportError};
use crate::fabric::{self, Fabric, LocalSge, RemoteSge};
use crate::memory::{BufferSet, MemoryRegion, RegionRegistry, Registration};
use crate::protocol::{Envelope, EnvelopeKind};
use crate::transport::{ControlChannel, StateMachine, control_accept, control_listen};
use crate::types::{ConnectionState, OpKind, RegionSlice, Role, SendMode};
use bytes::{Bytes, BytesMut};
use completed::CompletedTags;
use handshake::Handshaken;
use link::Link;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Snapshot of a session's connection, for logging and diagnostics.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    /// `None` until a handshake has completed.
    pub role: Option<Role>,
    /// Local end of the control channel, or the listen address.
    pub local_addr: SocketAddr,
    pub peer_addr: Option<SocketAddr>,
    pub fabric: &'static str,
    pub local_regions: usize,
    pub remote_regions: usize,
    pub in_flight: usize,
    /// Why the connection closed, if it did not close through `shutdown`.
    pub close_reason: Option<String>,
}

struct SessionInner {
    config: TransportConfig,
    local_addr: SocketAddr,
    fabric: Arc<dyn Fabric>,
    registry: RegionRegistry,
    state: StateMachine,
    link: Mutex<Option<Arc<Link>>>,
    bound: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    control_task: Mutex<Option<JoinHandle<()>>>,
    next_message_id: AtomicU64,
    completed: Mutex<CompletedTags>,
}

/// A transport endpoint that exchanges registered memory with one peer.
///
/// A session starts `Idle`. `connect` (client) or `listen` (server) opens
/// the control channel and runs the handshake, after which the session is
/// `Established` and the data path is usable:
///
/// - one-sided `write` / `read` (`recv` is the pull alias) move bytes
///   between a local region and a remote region without involving the
///   peer application;
/// - two-sided `send_message` / `send` / `notify` deliver envelopes the
///   peer consumes in order through `recv_message`.
///
/// Every data-path call fails with `NotConnected` outside `Established`.
/// `shutdown` is idempotent. `Closed` is terminal.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("local_addr", &self.inner.local_addr)
            .field("state", &self.inner.state.current())
            .field("fabric", &self.inner.fabric.name())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session on the fabric selected by `config`.
    ///
    /// `local_addr` is where `listen` binds its control listener; a client
    /// session never binds it.
    pub fn new(local_addr: SocketAddr, config: TransportConfig) -> Result<Self> {
        let fabric = fabric::open(&config)?;
        Ok(Self::with_fabric(local_addr, fabric, config))
    }

    pub fn with_fabric(
        local_addr: SocketAddr,
        fabric: Arc<dyn Fabric>,
        config: TransportConfig,
    ) -> Self {
        let registry = RegionRegistry::new(Arc::clone(&fabric), config.max_registration_bytes);
        let completed = Mutex::new(CompletedTags::new(config.completion_history));
        Self {
            inner: Arc::new(SessionInner {
                config,
                local_addr,
                fabric,
                registry,
                state: StateMachine::new(),
                link: Mutex::new(None),
                bound: Mutex::new(None),
                accept_task: Mutex::new(None),
                control_task: Mutex::new(None),
                next_message_id: AtomicU64::new(1),
                completed,
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    // ------------------------------------------------------------------
    // Memory regions
    // ------------------------------------------------------------------

    /// Register `[address + offset, address + offset + length)` and append it
    /// to the local BufferSet. Returns its index.
    ///
    /// The peer sees the BufferSet as it was at handshake time; regions
    /// registered afterwards are usable locally only.
    ///
    /// # Safety
    ///
    /// The memory must stay valid (allocated, not moved) until the region is
    /// unregistered and every operation using it has resolved. While
    /// registered, the peer may read and write it at any time.
    pub unsafe fn register_buffer(&self, address: u64, offset: u64, length: u64) -> Result<usize> {
        if self.state().is_closing() {
            return Err(TransportError::ConnectionClosed);
        }
        // SAFETY: forwarded to the caller.
        let (index, _) = unsafe { self.inner.registry.register(address, offset, length)? };
        Ok(index)
    }

    /// Unregister region `index`. Idempotent; returns whether this call
    /// released it.
    ///
    /// Operations already posted against the region keep it registered with
    /// the fabric until they resolve.
    pub fn unregister(&self, index: usize) -> bool {
        let released = self.inner.registry.unregister(index);
        if released {
            tracing::debug!(index, "memory region unregistered");
        }
        released
    }

    pub fn local_buffers(&self) -> BufferSet {
        self.inner.registry.buffers()
    }

    /// The peer's BufferSet, once connected.
    pub fn remote_buffers(&self) -> Option<BufferSet> {
        self.inner
            .current_link()
            .map(|link| link.remote_buffers.clone())
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Connect to a listening session and return its BufferSet.
    ///
    /// The control connection and the whole handshake are bounded by
    /// `connect_timeout`. Fails with `AlreadyConnected` if this session, or
    /// the server, already has a peer.
    pub async fn connect(&self, remote: SocketAddr) -> Result<BufferSet> {
        let inner = &self.inner;
        inner.begin()?;
        tracing::info!(%remote, fabric = inner.fabric.name(), "connecting");

        let timeout = inner.config.connect_timeout;
        let result = tokio::time::timeout(timeout, handshake::client(inner, remote))
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::connect(
                    remote,
                    format!("timed out after {timeout:?}"),
                ))
            })
            .map_err(|e| handshake::as_connect_error(remote, e))
            .and_then(|h| inner.install(h));

        if let Err(e) = &result {
            tracing::warn!(%remote, "connect failed: {e}");
            inner.abandon(e);
        }
        result
    }

    /// Bind the control listener and start accepting in the background.
    ///
    /// Returns the bound address. The first peer to connect is served; later
    /// ones are turned away with `AlreadyConnected`.
    pub async fn listen(&self) -> Result<SocketAddr> {
        let inner = &self.inner;
        inner.begin()?;
        let (listener, bound) = match control_listen(inner.local_addr).await {
            Ok(v) => v,
            Err(e) => {
                inner.abandon(&e);
                return Err(e);
            }
        };
        *lock(&inner.bound) = Some(bound);
        *lock(&inner.accept_task) =
            Some(tokio::spawn(accept_loop(listener, Arc::downgrade(inner))));
        // A shutdown that ran before the task was stored could not stop it.
        if inner.state.current().is_closing() {
            if let Some(task) = lock(&inner.accept_task).take() {
                task.abort();
            }
            return Err(TransportError::ConnectionClosed);
        }
        tracing::info!(%bound, fabric = inner.fabric.name(), "listening");
        Ok(bound)
    }

    /// Wait for the connection to be established and return the peer's
    /// BufferSet. Meant for the listening side.
    pub async fn wait_established(&self) -> Result<BufferSet> {
        let state = self.state();
        if state == ConnectionState::Idle {
            return Err(TransportError::NotConnected { state });
        }
        let state = self
            .inner
            .state
            .wait_for(|s| s == ConnectionState::Established || s.is_closing())
            .await;
        if state != ConnectionState::Established {
            return Err(TransportError::ConnectionClosed);
        }
        self.remote_buffers()
            .ok_or(TransportError::NotConnected { state })
    }

    /// Close the connection and release every local registration.
    ///
    /// New submissions are refused from the moment this is called. In-flight
    /// operations get up to `drain_timeout` to finish; whatever is left fails
    /// with `ConnectionLost`. Calling it again, or on a closed session, just
    /// waits for `Closed`.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        loop {
            let current = inner.state.current();
            if current.is_closing() {
                inner
                    .state
                    .wait_for(|s| s == ConnectionState::Closed)
                    .await;
                return;
            }
            if inner
                .state
                .advance_from(current, ConnectionState::Closing)
            {
                break;
            }
        }
        tracing::info!("shutting down");

        if let Some(task) = lock(&inner.accept_task).take() {
            task.abort();
        }
        if let Some(link) = inner.current_link() {
            // The peer tears down its queue pair on `Close`, so drain first.
            let drain = inner.config.drain_timeout;
            if tokio::time::timeout(drain, link.data.wait_idle()).await.is_err() {
                tracing::warn!(
                    in_flight = link.data.in_flight(),
                    "drain timed out after {drain:?}, cancelling"
                );
            }
            link.send_close(drain).await;
        }
        inner.teardown(None);
    }

    // ------------------------------------------------------------------
    // One-sided path
    // ------------------------------------------------------------------

    /// Post a one-sided write of `local` into the peer's `remote`.
    ///
    /// When neither slice has an explicit length, the remainders of both
    /// regions past their offsets must be equal.
    pub fn post_write(
        &self,
        local: impl Into<RegionSlice>,
        remote: impl Into<RegionSlice>,
    ) -> Result<PendingOperation> {
        let (link, l, r, pin) = self
            .inner
            .resolve_one_sided(OpKind::Write, local.into(), remote.into())?;
        link.data.post_write(l, r, vec![pin])
    }

    /// Post a one-sided read of the peer's `remote` into `local`.
    pub fn post_read(
        &self,
        local: impl Into<RegionSlice>,
        remote: impl Into<RegionSlice>,
    ) -> Result<PendingOperation> {
        let (link, l, r, pin) = self
            .inner
            .resolve_one_sided(OpKind::Read, local.into(), remote.into())?;
        link.data.post_read(l, r, vec![pin])
    }

    /// Write `local` into the peer's `remote` and wait for completion.
    pub async fn write(
        &self,
        local: impl Into<RegionSlice>,
        remote: impl Into<RegionSlice>,
    ) -> Result<()> {
        self.post_write(local, remote)?.await
    }

    /// Read the peer's `remote` into `local` and wait for completion.
    pub async fn read(
        &self,
        local: impl Into<RegionSlice>,
        remote: impl Into<RegionSlice>,
    ) -> Result<()> {
        self.post_read(local, remote)?.await
    }

    /// Pull the peer's `remote` region into `local`. Same as `read`.
    pub async fn recv(
        &self,
        local: impl Into<RegionSlice>,
        remote: impl Into<RegionSlice>,
    ) -> Result<()> {
        self.read(local, remote).await
    }

    // ------------------------------------------------------------------
    // Two-sided path
    // ------------------------------------------------------------------

    /// Post an envelope. Waits for a receive credit if the peer's window is
    /// full; the returned handle resolves once the fabric delivered it.
    pub async fn post_message(&self, envelope: &Envelope) -> Result<PendingOperation> {
        let link = self.inner.established_link()?;
        check_envelope(envelope)?;
        link.data.post_message(envelope.encode()?, None).await
    }

    pub async fn send_message(&self, envelope: &Envelope) -> Result<()> {
        self.post_message(envelope).await?.await
    }

    /// Send `length` bytes of local region `local_index`, tagged with `tag`.
    ///
    /// With `SendMode::TwoSided` the bytes travel as an envelope payload.
    /// With `SendMode::OneSided` they are written into the peer's region of
    /// the same index, followed by a `WriteNotice` envelope. Returns the
    /// envelope id.
    pub async fn send(&self, local_index: usize, length: u64, tag: impl AsRef<[u8]>) -> Result<u64> {
        let inner = &self.inner;
        let link = inner.established_link()?;
        let id = inner.next_message_id.fetch_add(1, Ordering::Relaxed);
        let tag = tag.as_ref();

        match inner.config.send_mode {
            SendMode::TwoSided => {
                let pin = inner.pin_local(OpKind::Send, local_index)?;
                let addr = pin.region().resolve(0, length).ok_or_else(|| {
                    TransportError::operation(
                        OpKind::Send,
                        format!(
                            "{length} bytes exceed local region {local_index} ({} bytes)",
                            pin.region().length
                        ),
                    )
                })?;
                let mut prefix = BytesMut::new();
                Envelope::encode_prefix(id, length, tag, EnvelopeKind::Message, &mut prefix)?;
                let gather = (length > 0).then(|| {
                    let sge = LocalSge {
                        addr,
                        length,
                        lkey: pin.lkey(),
                    };
                    (sge, pin)
                });
                link.data.post_message(prefix.freeze(), gather).await?.await?;
            }
            SendMode::OneSided => {
                let region = u32::try_from(local_index).map_err(|_| {
                    TransportError::operation(OpKind::Send, "region index exceeds u32")
                })?;
                let slice = RegionSlice::range(local_index, 0, length);
                self.write(slice, slice).await?;
                let notice =
                    Envelope::write_notice(id, region, length, Bytes::copy_from_slice(tag));
                link.data.post_message(notice.encode()?, None).await?.await?;
            }
        }
        tracing::debug!(id, local_index, length, mode = ?inner.config.send_mode, "sent");
        Ok(id)
    }

    /// Send an empty envelope tagged `tag`, marking a request as done.
    /// Returns its id.
    pub async fn notify(&self, tag: impl AsRef<[u8]>) -> Result<u64> {
        let id = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(id, Bytes::copy_from_slice(tag.as_ref()), Bytes::new());
        self.send_message(&envelope).await?;
        lock(&self.inner.completed).record(envelope.tag);
        Ok(id)
    }

    /// Whether `tag` went out through `notify` or arrived through
    /// `recv_message` recently enough to still be remembered.
    ///
    /// Only the last `completion_history` tags are kept.
    pub fn is_complete(&self, tag: impl AsRef<[u8]>) -> bool {
        lock(&self.inner.completed).contains(tag.as_ref())
    }

    /// Next envelope from the peer, in arrival order.
    ///
    /// Envelopes that arrived before the connection closed are still
    /// returned; after that this fails with `ConnectionClosed`.
    pub async fn recv_message(&self) -> Result<Envelope> {
        let state = self.state();
        match state {
            ConnectionState::Idle | ConnectionState::Connecting | ConnectionState::Handshaking => {
                return Err(TransportError::NotConnected { state });
            }
            ConnectionState::Established | ConnectionState::Closing | ConnectionState::Closed => {}
        }
        let link = self
            .inner
            .current_link()
            .ok_or(TransportError::ConnectionClosed)?;
        let envelope = link
            .data
            .recv_envelope()
            .await
            .ok_or(TransportError::ConnectionClosed)?;
        lock(&self.inner.completed).record(envelope.tag.clone());
        Ok(envelope)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Operations posted and not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.inner
            .current_link()
            .map_or(0, |link| link.data.in_flight())
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        let inner = &self.inner;
        let link = inner.current_link();
        let local_addr = link
            .as_ref()
            .map(|l| l.local_control)
            .or(*lock(&inner.bound))
            .unwrap_or(inner.local_addr);
        ConnectionInfo {
            state: inner.state.current(),
            role: link.as_ref().map(|l| l.role),
            local_addr,
            peer_addr: link.as_ref().map(|l| l.peer_control),
            fabric: inner.fabric.name(),
            local_regions: inner.registry.registered_count(),
            remote_regions: link.as_ref().map_or(0, |l| l.remote_buffers.len()),
            in_flight: link.as_ref().map_or(0, |l| l.data.in_flight()),
            close_reason: inner.state.close_reason(),
        }
    }
}

/// Reject envelopes whose header would not match their body.
fn check_envelope(envelope: &Envelope) -> Result<()> {
    let consistent = match envelope.kind {
        EnvelopeKind::Message => envelope.length == envelope.payload.len() as u64,
        EnvelopeKind::WriteNotice { .. } => envelope.payload.is_empty(),
    };
    if consistent {
        Ok(())
    } else {
        Err(TransportError::operation(
            OpKind::Send,
            format!(
                "envelope length {} does not match its {} byte payload",
                envelope.length,
                envelope.payload.len()
            ),
        ))
    }
}

/// Number of bytes a one-sided transfer moves.
fn transfer_len(
    op: OpKind,
    local: &RegionSlice,
    local_region: &MemoryRegion,
    remote: &RegionSlice,
    remote_region: &MemoryRegion,
) -> Result<u64> {
    let len = match (local.length, remote.length) {
        (Some(a), Some(b)) if a != b => {
            return Err(TransportError::operation(
                op,
                format!("local length {a} does not match remote length {b}"),
            ));
        }
        (Some(len), _) | (None, Some(len)) => len,
        (None, None) => {
            let local_rest = local_region.length.checked_sub(local.offset);
            let remote_rest = remote_region.length.checked_sub(remote.offset);
            match (local_rest, remote_rest) {
                (Some(a), Some(b)) if a == b => a,
                (Some(a), Some(b)) => {
                    return Err(TransportError::operation(
                        op,
                        format!("local span of {a} bytes does not match remote span of {b} bytes"),
                    ));
                }
                _ => {
                    return Err(TransportError::operation(op, "offset past end of region"));
                }
            }
        }
    };
    if len == 0 {
        return Err(TransportError::operation(op, "zero-length transfer"));
    }
    Ok(len)
}

impl SessionInner {
    fn current_link(&self) -> Option<Arc<Link>> {
        lock(&self.link).clone()
    }

    fn established_link(&self) -> Result<Arc<Link>> {
        let state = self.state.current();
        if state != ConnectionState::Established {
            return Err(TransportError::NotConnected { state });
        }
        self.current_link()
            .ok_or(TransportError::NotConnected { state })
    }

    /// `Idle -> Connecting`, the entry to both `connect` and `listen`.
    fn begin(&self) -> Result<()> {
        if self
            .state
            .advance_from(ConnectionState::Idle, ConnectionState::Connecting)
        {
            return Ok(());
        }
        if self.state.current().is_closing() {
            Err(TransportError::ConnectionClosed)
        } else {
            Err(TransportError::AlreadyConnected)
        }
    }

    fn pin_local(&self, op: OpKind, index: usize) -> Result<Arc<Registration>> {
        self.registry.pin(index).ok_or_else(|| {
            TransportError::operation(op, format!("local region {index} is not registered"))
        })
    }

    fn resolve_one_sided(
        &self,
        op: OpKind,
        local: RegionSlice,
        remote: RegionSlice,
    ) -> Result<(Arc<Link>, LocalSge, RemoteSge, Arc<Registration>)> {
        let link = self.established_link()?;
        let pin = self.pin_local(op, local.index)?;
        let remote_region = *link.remote_buffers.get(remote.index).ok_or_else(|| {
            TransportError::operation(
                op,
                format!(
                    "remote region {} does not exist (peer has {})",
                    remote.index,
                    link.remote_buffers.len()
                ),
            )
        })?;
        let local_region = *pin.region();
        let len = transfer_len(op, &local, &local_region, &remote, &remote_region)?;

        let local_addr = local_region.resolve(local.offset, len).ok_or_else(|| {
            TransportError::operation(
                op,
                format!(
                    "local range {}+{len} exceeds region {} ({} bytes)",
                    local.offset, local.index, local_region.length
                ),
            )
        })?;
        let remote_addr = remote_region.resolve(remote.offset, len).ok_or_else(|| {
            TransportError::operation(
                op,
                format!(
                    "remote range {}+{len} exceeds region {} ({} bytes)",
                    remote.offset, remote.index, remote_region.length
                ),
            )
        })?;

        let l = LocalSge {
            addr: local_addr,
            length: len,
            lkey: pin.lkey(),
        };
        let r = RemoteSge {
            addr: remote_addr,
            rkey: remote_region.access_key.0,
        };
        Ok((link, l, r, pin))
    }

    /// Attach a freshly handshaken peer and move to `Established`.
    fn install(self: &Arc<Self>, h: Handshaken) -> Result<BufferSet> {
        let local = h.channel.local_addr();
        let peer = h.channel.peer_addr();
        let (reader, writer) = h.channel.into_split();

        let weak = Arc::downgrade(self);
        let data = DataChannel::start(
            h.conn,
            DataChannelParams {
                peer_recv_depth: h.peer_recv_depth,
                local_recv_depth: self.config.recv_queue_depth,
                operation_timeout: self.config.operation_timeout,
                max_message_bytes: h.message_limit,
            },
            move |reason| {
                if let Some(inner) = weak.upgrade() {
                    inner.connection_lost(reason);
                }
            },
        );
        let remote_buffers = h.remote_buffers.clone();
        let link = Arc::new(Link::new(h.role, local, peer, h.remote_buffers, data, writer));
        // Published before the state flips so `Established` always has a link.
        *lock(&self.link) = Some(Arc::clone(&link));

        if !self
            .state
            .advance_from(ConnectionState::Handshaking, ConnectionState::Established)
        {
            lock(&self.link).take();
            link.data.close("session closed during handshake");
            return Err(TransportError::ConnectionClosed);
        }
        *lock(&self.control_task) = Some(tokio::spawn(link::control_loop(
            reader,
            Arc::downgrade(self),
        )));
        tracing::info!(
            role = %h.role,
            %peer,
            remote_regions = remote_buffers.len(),
            "connection established"
        );
        Ok(remote_buffers)
    }

    /// A connection attempt failed: the session is done.
    fn abandon(&self, e: &TransportError) {
        self.teardown(Some(&e.to_string()));
    }

    /// The data path reported a fatal error.
    fn connection_lost(&self, reason: String) {
        if self.state.current().is_closing() {
            return;
        }
        tracing::warn!("connection lost: {reason}");
        self.teardown(Some(&reason));
    }

    /// The peer sent `Close`, or the control channel went away. Let
    /// in-flight operations finish, then close.
    async fn peer_closed(&self, reason: String) {
        if !self
            .state
            .advance_from(ConnectionState::Established, ConnectionState::Closing)
        {
            return;
        }
        tracing::info!("peer closing: {reason}");
        if let Some(link) = self.current_link() {
            let drain = self.config.drain_timeout;
            if tokio::time::timeout(drain, link.data.wait_idle()).await.is_err() {
                tracing::warn!(
                    in_flight = link.data.in_flight(),
                    "drain timed out after {drain:?}, cancelling"
                );
            }
        }
        self.teardown(Some(&reason));
    }

    /// Release everything and land in `Closed`. `failure` is recorded as the
    /// close reason and handed to cancelled operations.
    fn teardown(&self, failure: Option<&str>) {
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
        if let Some(link) = self.current_link() {
            let cancelled = link.data.close(failure.unwrap_or("session shut down"));
            if cancelled > 0 {
                tracing::debug!(cancelled, "cancelled in-flight operations");
            }
        }
        if let Some(task) = lock(&self.control_task).take() {
            task.abort();
        }
        let released = self.registry.unregister_all();
        match failure {
            Some(reason) => {
                self.state.fail(reason);
            }
            None => {
                self.state.advance(ConnectionState::Closed);
            }
        }
        tracing::info!(released, "session closed");
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
        if let Some(task) = lock(&self.control_task).take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, session: Weak<SessionInner>) {
    loop {
        let channel = match control_accept(&listener).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!("control accept failed: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let Some(inner) = session.upgrade() else {
            return;
        };
        if inner
            .state
            .advance_from(ConnectionState::Connecting, ConnectionState::Handshaking)
        {
            tokio::spawn(serve_peer(inner, channel));
        } else {
            tokio::spawn(handshake::reject(channel, inner.state.current()));
        }
    }
}

async fn serve_peer(inner: Arc<SessionInner>, channel: ControlChannel) {
    let peer = channel.peer_addr();
    tracing::info!(%peer, "peer connected, handshaking");
    let timeout = inner.config.connect_timeout;
    let result = tokio::time::timeout(timeout, handshake::server(&inner, channel))
        .await
        .unwrap_or_else(|_| {
            Err(TransportError::connect(
                peer,
                format!("handshake timed out after {timeout:?}"),
            ))
        })
        .and_then(|h| inner.install(h));
    if let Err(e) = result {
        tracing::warn!(%peer, "handshake failed: {e}");
        inner.abandon(&e);
    }
}
