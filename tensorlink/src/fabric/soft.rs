//! Software fabric: reliable-connected queue pairs emulated over TCP.
//!
//! Every connected queue pair owns a dedicated TCP stream. A reader task
//! stands in for the NIC: it services the peer's one-sided reads and writes
//! directly against memory registered in the local domain, acknowledges
//! writes and sends, and turns acknowledgements into work completions. The
//! application is never involved on the target side of a one-sided op.
//!
//! Frame layout (little-endian, 30-byte header):
//!
//! ```text
//! [op: u8][status: u8][rkey: u32][wr_id: u64][addr: u64][len: u64][data]
//! ```
//!
//! `data` is present (and `len` bytes long) for WRITE, SEND and READ_RESP.

use super::{
    CompletionEvent, ConnectedQueuePair, Fabric, LocalSge, PreparedQueuePair, QueueParams,
    QueuePair, RegisteredMemory, WcStatus, WorkCompletion, WorkRequest,
};
use crate::config::FabricKind;
use crate::error::{Result, TransportError};
use crate::types::{OpKind, Role};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const HEADER_SIZE: usize = 30;

/// Largest data section accepted from the peer (4 GiB).
const MAX_FRAME_DATA: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Op {
    Write = 1,
    Read = 2,
    Send = 3,
    Ack = 4,
    ReadResp = 5,
}

impl Op {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Op::Write),
            2 => Some(Op::Read),
            3 => Some(Op::Send),
            4 => Some(Op::Ack),
            5 => Some(Op::ReadResp),
            _ => None,
        }
    }

    fn carries_data(self) -> bool {
        matches!(self, Op::Write | Op::Send | Op::ReadResp)
    }
}

fn status_code(status: &WcStatus) -> u8 {
    match status {
        WcStatus::Success => 0,
        WcStatus::RemoteAccess => 1,
        WcStatus::LocalAccess => 2,
        WcStatus::Flushed => 3,
        WcStatus::Failed(_) => 4,
    }
}

fn status_from_code(code: u8) -> WcStatus {
    match code {
        0 => WcStatus::Success,
        1 => WcStatus::RemoteAccess,
        2 => WcStatus::LocalAccess,
        3 => WcStatus::Flushed,
        other => WcStatus::Failed(format!("peer reported status {other}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    op: u8,
    status: u8,
    rkey: u32,
    wr_id: u64,
    addr: u64,
    len: u64,
}

impl Header {
    fn parse(mut buf: &[u8]) -> Self {
        Self {
            op: buf.get_u8(),
            status: buf.get_u8(),
            rkey: buf.get_u32_le(),
            wr_id: buf.get_u64_le(),
            addr: buf.get_u64_le(),
            len: buf.get_u64_le(),
        }
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u8(self.op);
        buf.put_u8(self.status);
        buf.put_u32_le(self.rkey);
        buf.put_u64_le(self.wr_id);
        buf.put_u64_le(self.addr);
        buf.put_u64_le(self.len);
        buf.freeze()
    }
}

struct Frame {
    head: Bytes,
    data: Bytes,
}

impl Frame {
    fn new(op: Op, status: &WcStatus, rkey: u32, wr_id: u64, addr: u64, data: Bytes) -> Self {
        Self::with_len(op, status, rkey, wr_id, addr, data.len() as u64, data)
    }

    fn with_len(
        op: Op,
        status: &WcStatus,
        rkey: u32,
        wr_id: u64,
        addr: u64,
        len: u64,
        data: Bytes,
    ) -> Self {
        let head = Header {
            op: op as u8,
            status: status_code(status),
            rkey,
            wr_id,
            addr,
            len,
        }
        .encode();
        Self { head, data }
    }

    fn ack(wr_id: u64, status: &WcStatus) -> Self {
        Self::new(Op::Ack, status, 0, wr_id, 0, Bytes::new())
    }
}

#[derive(Debug, Clone, Copy)]
struct Span {
    addr: u64,
    len: u64,
}

/// Registration table shared by every queue pair of one `SoftFabric`.
#[derive(Default)]
struct SoftDomain {
    next_key: AtomicU32,
    regions: RwLock<HashMap<u32, Span>>,
}

impl SoftDomain {
    fn insert(&self, span: Span) -> u32 {
        // Key 0 is never issued.
        let key = self.next_key.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        self.regions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, span);
        key
    }

    fn remove(&self, key: u32) {
        self.regions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }

    /// Run `f` on `[addr, addr + len)` if it lies inside the span registered
    /// under `key`. The table stays read-locked for the duration, so the span
    /// cannot be deregistered mid-copy.
    fn with_span<R>(&self, key: u32, addr: u64, len: u64, f: impl FnOnce(*mut u8) -> R) -> Option<R> {
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        let span = regions.get(&key)?;
        let end = addr.checked_add(len)?;
        if addr < span.addr || end > span.addr + span.len {
            return None;
        }
        Some(f(addr as *mut u8))
    }

    fn contains(&self, key: u32, addr: u64, len: u64) -> bool {
        self.with_span(key, addr, len, |_| ()).is_some()
    }

    fn copy_out(&self, key: u32, addr: u64, len: u64) -> Option<Bytes> {
        self.with_span(key, addr, len, |ptr| {
            // SAFETY: the range is inside a live registration, whose owner
            // guarantees the memory stays valid until deregistered.
            let src = unsafe { std::slice::from_raw_parts(ptr as *const u8, len as usize) };
            Bytes::copy_from_slice(src)
        })
    }

    fn copy_in(&self, key: u32, addr: u64, data: &[u8]) -> bool {
        self.with_span(key, addr, data.len() as u64, |ptr| {
            // SAFETY: as in `copy_out`; registered memory is remotely writable.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) }
        })
        .is_some()
    }
}

/// Host-memory fabric backed by TCP. Always available.
#[derive(Default)]
pub struct SoftFabric {
    domain: Arc<SoftDomain>,
}

impl SoftFabric {
    pub fn new() -> Self {
        Self::default()
    }
}

struct SoftMemory {
    key: u32,
    domain: Arc<SoftDomain>,
}

impl RegisteredMemory for SoftMemory {
    fn lkey(&self) -> u32 {
        self.key
    }

    fn rkey(&self) -> u32 {
        self.key
    }
}

impl Drop for SoftMemory {
    fn drop(&mut self) {
        self.domain.remove(self.key);
    }
}

impl Fabric for SoftFabric {
    fn kind(&self) -> FabricKind {
        FabricKind::Soft
    }

    fn name(&self) -> &'static str {
        "soft"
    }

    unsafe fn register(&self, addr: u64, len: u64) -> Result<Box<dyn RegisteredMemory>> {
        if addr == 0 {
            return Err(TransportError::Registration(
                "soft fabric: null address".into(),
            ));
        }
        if len == 0 {
            return Err(TransportError::Registration(
                "soft fabric: zero-length span".into(),
            ));
        }
        if addr.checked_add(len).is_none() || usize::try_from(len).is_err() {
            return Err(TransportError::Registration(format!(
                "soft fabric: span {addr:#x}+{len} exceeds the address space"
            )));
        }
        let key = self.domain.insert(Span { addr, len });
        tracing::debug!(key, addr = format_args!("{addr:#x}"), len, "soft fabric registered span");
        Ok(Box::new(SoftMemory {
            key,
            domain: Arc::clone(&self.domain),
        }))
    }

    fn prepare<'a>(
        &'a self,
        role: Role,
        local: SocketAddr,
        peer: SocketAddr,
        params: QueueParams,
    ) -> BoxFuture<'a, Result<Box<dyn PreparedQueuePair>>> {
        Box::pin(async move {
            let side = match role {
                Role::Server => {
                    let listener = TcpListener::bind(SocketAddr::new(local.ip(), 0))
                        .await
                        .map_err(|e| {
                            TransportError::fabric_with_source("soft fabric: bind data listener", e)
                        })?;
                    let port = listener.local_addr()?.port();
                    Side::Listen { listener, port }
                }
                Role::Client => Side::Dial,
            };
            Ok(Box::new(PreparedSoftQp {
                domain: Arc::clone(&self.domain),
                side,
                peer_ip: peer.ip(),
                max_recv: params.max_frame_bytes() as u64,
            }) as Box<dyn PreparedQueuePair>)
        })
    }
}

enum Side {
    /// Server: the endpoint is the port of this listener.
    Listen { listener: TcpListener, port: u16 },
    /// Client: dials the server's endpoint.
    Dial,
}

struct PreparedSoftQp {
    domain: Arc<SoftDomain>,
    side: Side,
    peer_ip: IpAddr,
    /// Largest SEND the peer may deliver to us.
    max_recv: u64,
}

impl PreparedQueuePair for PreparedSoftQp {
    fn endpoint(&self) -> Bytes {
        match &self.side {
            Side::Listen { port, .. } => Bytes::copy_from_slice(&port.to_le_bytes()),
            Side::Dial => Bytes::new(),
        }
    }

    fn complete(
        self: Box<Self>,
        remote: Bytes,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<ConnectedQueuePair>> {
        let this = *self;
        Box::pin(async move {
            let stream = match this.side {
                Side::Listen { listener, .. } => {
                    let (stream, from) = tokio::time::timeout(timeout, listener.accept())
                        .await
                        .map_err(|_| {
                            TransportError::fabric("soft fabric: timed out waiting for peer data stream")
                        })?
                        .map_err(|e| TransportError::fabric_with_source("soft fabric: accept", e))?;
                    if from.ip() != this.peer_ip {
                        tracing::warn!(%from, expected = %this.peer_ip, "soft fabric: data stream from unexpected host");
                    }
                    stream
                }
                Side::Dial => {
                    if remote.len() != 2 {
                        return Err(TransportError::Protocol(format!(
                            "soft fabric endpoint must be 2 bytes, got {}",
                            remote.len()
                        )));
                    }
                    let port = u16::from_le_bytes([remote[0], remote[1]]);
                    let addr = SocketAddr::new(this.peer_ip, port);
                    tokio::time::timeout(timeout, TcpStream::connect(addr))
                        .await
                        .map_err(|_| TransportError::fabric(format!("soft fabric: connect {addr} timed out")))?
                        .map_err(|e| {
                            TransportError::fabric_with_source(format!("soft fabric: connect {addr}"), e)
                        })?
                }
            };
            stream
                .set_nodelay(true)
                .map_err(|e| TransportError::fabric_with_source("soft fabric: set_nodelay", e))?;
            Ok(SoftQueuePair::start(stream, this.domain, this.max_recv))
        })
    }
}

/// A connected soft queue pair.
pub struct SoftQueuePair {
    domain: Arc<SoftDomain>,
    outbound: mpsc::UnboundedSender<Frame>,
    /// Local targets of reads awaiting READ_RESP, by wr_id.
    reads: Arc<Mutex<HashMap<u64, LocalSge>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SoftQueuePair {
    fn start(stream: TcpStream, domain: Arc<SoftDomain>, max_recv: u64) -> ConnectedQueuePair {
        let (rd, wr) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (cq_tx, cq_rx) = mpsc::unbounded_channel();
        let reads = Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(write_loop(wr, out_rx, cq_tx.clone()));
        let reader = tokio::spawn(nic_loop(
            rd,
            Arc::clone(&domain),
            out_tx.clone(),
            Arc::clone(&reads),
            cq_tx,
            max_recv,
        ));

        ConnectedQueuePair {
            qp: Box::new(SoftQueuePair {
                domain,
                outbound: out_tx,
                reads,
                reader,
                writer,
            }),
            completions: cq_rx,
        }
    }

    fn enqueue(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionLost("soft fabric data stream closed".into()))
    }

    fn local_bytes(&self, op: OpKind, sge: &LocalSge) -> Result<Bytes> {
        self.domain
            .copy_out(sge.lkey, sge.addr, sge.length)
            .ok_or_else(|| local_range_error(op, sge))
    }
}

fn local_range_error(op: OpKind, sge: &LocalSge) -> TransportError {
    TransportError::operation(
        op,
        format!(
            "local range {:#x}+{} is not registered under lkey {}",
            sge.addr, sge.length, sge.lkey
        ),
    )
}

impl QueuePair for SoftQueuePair {
    fn post(&self, wr: WorkRequest) -> Result<()> {
        match wr {
            WorkRequest::Write {
                wr_id,
                local,
                remote,
            } => {
                let data = self.local_bytes(OpKind::Write, &local)?;
                self.enqueue(Frame::new(
                    Op::Write,
                    &WcStatus::Success,
                    remote.rkey,
                    wr_id,
                    remote.addr,
                    data,
                ))
            }
            WorkRequest::Read {
                wr_id,
                local,
                remote,
            } => {
                if !self.domain.contains(local.lkey, local.addr, local.length) {
                    return Err(local_range_error(OpKind::Read, &local));
                }
                self.reads
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(wr_id, local);
                let frame = Frame::with_len(
                    Op::Read,
                    &WcStatus::Success,
                    remote.rkey,
                    wr_id,
                    remote.addr,
                    local.length,
                    Bytes::new(),
                );
                self.enqueue(frame).inspect_err(|_| {
                    self.reads
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&wr_id);
                })
            }
            WorkRequest::Send {
                wr_id,
                inline,
                gather,
            } => {
                let data = match gather {
                    None => inline,
                    Some(sge) => {
                        let tail = self.local_bytes(OpKind::Send, &sge)?;
                        let mut buf = BytesMut::with_capacity(inline.len() + tail.len());
                        buf.extend_from_slice(&inline);
                        buf.extend_from_slice(&tail);
                        buf.freeze()
                    }
                };
                self.enqueue(Frame::new(Op::Send, &WcStatus::Success, 0, wr_id, 0, data))
            }
        }
    }

    fn disconnect(&self) {
        self.reader.abort();
        self.writer.abort();
        self.reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for SoftQueuePair {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn write_loop(
    mut wr: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    cq: mpsc::UnboundedSender<CompletionEvent>,
) {
    while let Some(frame) = rx.recv().await {
        let res = async {
            wr.write_all(&frame.head).await?;
            if !frame.data.is_empty() {
                wr.write_all(&frame.data).await?;
            }
            Ok::<(), std::io::Error>(())
        }
        .await;
        if let Err(e) = res {
            tracing::debug!("soft fabric write loop ended: {e}");
            let _ = cq.send(CompletionEvent::Fatal(format!("data stream write failed: {e}")));
            return;
        }
    }
}

/// Target-side engine: services the peer's requests and completes our own.
async fn nic_loop(
    mut rd: OwnedReadHalf,
    domain: Arc<SoftDomain>,
    out: mpsc::UnboundedSender<Frame>,
    reads: Arc<Mutex<HashMap<u64, LocalSge>>>,
    cq: mpsc::UnboundedSender<CompletionEvent>,
    max_recv: u64,
) {
    let mut head = [0u8; HEADER_SIZE];
    let reason = loop {
        if let Err(e) = rd.read_exact(&mut head).await {
            break format!("data stream closed: {e}");
        }
        let h = Header::parse(&head);
        let Some(op) = Op::from_u8(h.op) else {
            break format!("unknown soft fabric op {}", h.op);
        };
        // `None` when the data section has nowhere to go and was skipped.
        let data = if op.carries_data() {
            if h.len > MAX_FRAME_DATA {
                break format!("soft fabric frame too large ({} bytes)", h.len);
            }
            let fits = match op {
                Op::Write => domain.contains(h.rkey, h.addr, h.len),
                Op::Send => h.len <= max_recv,
                Op::ReadResp => reads
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&h.wr_id)
                    .is_some_and(|local| local.length == h.len),
                Op::Read | Op::Ack => false,
            };
            match read_data(&mut rd, h.len, fits).await {
                Ok(data) => data,
                Err(e) => break format!("data stream closed mid-frame: {e}"),
            }
        } else {
            Some(Bytes::new())
        };

        match op {
            Op::Write => {
                let status = match &data {
                    Some(data) if domain.copy_in(h.rkey, h.addr, data) => WcStatus::Success,
                    _ => WcStatus::RemoteAccess,
                };
                let _ = out.send(Frame::ack(h.wr_id, &status));
            }
            Op::Read => {
                let frame = match domain.copy_out(h.rkey, h.addr, h.len) {
                    Some(bytes) => Frame::new(Op::ReadResp, &WcStatus::Success, 0, h.wr_id, 0, bytes),
                    None => Frame::new(
                        Op::ReadResp,
                        &WcStatus::RemoteAccess,
                        0,
                        h.wr_id,
                        0,
                        Bytes::new(),
                    ),
                };
                let _ = out.send(frame);
            }
            Op::Send => {
                let Some(data) = data else {
                    break format!(
                        "peer sent a {} byte message, receive limit is {max_recv}",
                        h.len
                    );
                };
                if cq.send(CompletionEvent::Recv(data)).is_err() {
                    break "completion queue closed".to_string();
                }
                let _ = out.send(Frame::ack(h.wr_id, &WcStatus::Success));
            }
            Op::Ack => {
                let wc = WorkCompletion {
                    wr_id: h.wr_id,
                    status: status_from_code(h.status),
                };
                if cq.send(CompletionEvent::Work(wc)).is_err() {
                    break "completion queue closed".to_string();
                }
            }
            Op::ReadResp => {
                let local = reads
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&h.wr_id);
                let Some(local) = local else {
                    tracing::debug!(wr_id = h.wr_id, "soft fabric: read response for unknown request");
                    continue;
                };
                let remote_status = status_from_code(h.status);
                let status = match &data {
                    _ if !remote_status.is_success() => remote_status,
                    None => WcStatus::Failed(format!(
                        "short read: wanted {} bytes, got {}",
                        local.length, h.len
                    )),
                    Some(data) if domain.copy_in(local.lkey, local.addr, data) => {
                        WcStatus::Success
                    }
                    Some(_) => WcStatus::LocalAccess,
                };
                let wc = WorkCompletion {
                    wr_id: h.wr_id,
                    status,
                };
                if cq.send(CompletionEvent::Work(wc)).is_err() {
                    break "completion queue closed".to_string();
                }
            }
        }
    };
    tracing::debug!("soft fabric nic loop ended: {reason}");
    let _ = cq.send(CompletionEvent::Fatal(reason));
}

/// Read a `len` byte data section, or skip over it when `keep` is false so
/// the stream stays framed without buffering bytes nobody will take.
async fn read_data(rd: &mut OwnedReadHalf, len: u64, keep: bool) -> std::io::Result<Option<Bytes>> {
    if !keep {
        let skipped = tokio::io::copy(&mut rd.take(len), &mut tokio::io::sink()).await?;
        if skipped != len {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        return Ok(None);
    }
    let mut buf = vec![0u8; len as usize];
    rd.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}
