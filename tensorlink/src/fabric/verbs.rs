//! InfiniBand/RoCE fabric over raw `ibverbs-sys` FFI (no safe wrapper).
//!
//! One device and protection domain per fabric. Each queue pair gets its
//! own completion queue, a pool of pre-posted receive slots and a pool of
//! send staging slots (both registered once up front), plus a polling
//! thread that turns work completions into `CompletionEvent`s.
//!
//! Queue pair bring-up:
//! 1. `prepare()` creates the CQ and an RC QP in INIT state.
//! 2. `{qp_num, lid, gid}` endpoints are exchanged over the control channel.
//! 3. `complete()` moves the QP to RTR then RTS, posts the receive slots and
//!    starts the poller.

use super::{
    CompletionEvent, ConnectedQueuePair, Fabric, LocalSge, PreparedQueuePair, QueueParams,
    QueuePair, RegisteredMemory, RemoteSge, WcStatus, WorkCompletion, WorkRequest,
};
use crate::config::FabricKind;
use crate::error::{Result, TransportError};
use crate::types::{OpKind, Role};
use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use futures::future::BoxFuture;
use ibverbs_sys::{
    ibv_access_flags, ibv_qp_attr_mask, ibv_qp_state, ibv_send_flags, ibv_wc_status,
    ibv_wr_opcode,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::raw::c_int;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

const ENDPOINT_SIZE: usize = 22;
const PORT_NUM: u8 = 1;
const MAX_SEND_WR: u32 = 128;
const POLL_BATCH: usize = 16;
/// Marks receive-slot wr_ids. Data-path wr_ids never carry this bit.
const RECV_WR_TAG: u64 = 1 << 62;

fn remote_access() -> ibv_access_flags {
    ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
        | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
        | ibv_access_flags::IBV_ACCESS_REMOTE_READ
}

/// Endpoint data exchanged between peers to connect an RC queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VerbsEndpoint {
    qp_num: u32,
    lid: u16,
    gid: [u8; 16],
}

impl VerbsEndpoint {
    fn to_bytes(self) -> Bytes {
        let mut buf = [0u8; ENDPOINT_SIZE];
        buf[0..4].copy_from_slice(&self.qp_num.to_le_bytes());
        buf[4..6].copy_from_slice(&self.lid.to_le_bytes());
        buf[6..22].copy_from_slice(&self.gid);
        Bytes::copy_from_slice(&buf)
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != ENDPOINT_SIZE {
            return Err(TransportError::Protocol(format!(
                "verbs endpoint must be {ENDPOINT_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[6..22]);
        Ok(Self {
            qp_num: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            lid: u16::from_le_bytes([buf[4], buf[5]]),
            gid,
        })
    }
}

/// An RDMA device visible to this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Position in the device list; the value `FabricKind::Verbs` takes.
    pub index: usize,
    pub name: String,
    /// Node GUID in host byte order.
    pub guid: u64,
}

impl std::fmt::Display for DeviceInfo {
    /// `mlx5_0 (guid 0c42:a103:0062:b7b4)`, the grouping `ibv_devinfo` prints.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let g = self.guid;
        write!(
            f,
            "{} (guid {:04x}:{:04x}:{:04x}:{:04x})",
            self.name,
            (g >> 48) & 0xffff,
            (g >> 32) & 0xffff,
            (g >> 16) & 0xffff,
            g & 0xffff
        )
    }
}

/// Enumerate the RDMA devices on this host.
///
/// An empty list is not an error; a host without the verbs stack loaded
/// simply has no devices.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let Some(list) = DeviceList::fetch() else {
        return Ok(Vec::new());
    };
    Ok((0..list.len())
        .map(|index| {
            let dev = list.get(index);
            DeviceInfo {
                index,
                name: device_name(dev, index),
                guid: u64::from_be(unsafe { ibverbs_sys::ibv_get_device_guid(dev) }),
            }
        })
        .collect())
}

/// Owned `ibv_get_device_list` result, freed on drop.
struct DeviceList {
    devices: *mut *mut ibverbs_sys::ibv_device,
    len: usize,
}

impl DeviceList {
    fn fetch() -> Option<Self> {
        let mut num_devices: c_int = 0;
        let devices = unsafe { ibverbs_sys::ibv_get_device_list(&mut num_devices) };
        if devices.is_null() {
            return None;
        }
        Some(Self {
            devices,
            len: usize::try_from(num_devices).unwrap_or(0),
        })
    }

    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> *mut ibverbs_sys::ibv_device {
        debug_assert!(index < self.len);
        unsafe { *self.devices.add(index) }
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        unsafe { ibverbs_sys::ibv_free_device_list(self.devices) };
    }
}

fn device_name(dev: *mut ibverbs_sys::ibv_device, index: usize) -> String {
    let name_ptr = unsafe { ibverbs_sys::ibv_get_device_name(dev) };
    if name_ptr.is_null() {
        return format!("rdma{index}");
    }
    unsafe { std::ffi::CStr::from_ptr(name_ptr) }
        .to_string_lossy()
        .into_owned()
}

/// Open device context and protection domain.
struct VerbsDevice {
    ctx: *mut ibverbs_sys::ibv_context,
    pd: *mut ibverbs_sys::ibv_pd,
    name: String,
}

unsafe impl Send for VerbsDevice {}
unsafe impl Sync for VerbsDevice {}

impl VerbsDevice {
    fn open(index: usize) -> Result<Self> {
        let list = match DeviceList::fetch() {
            Some(list) if list.len() > 0 => list,
            _ => return Err(TransportError::fabric("RDMA: no devices found")),
        };
        if index >= list.len() {
            return Err(TransportError::fabric(format!(
                "RDMA: device index {index} out of range (have {})",
                list.len()
            )));
        }

        let dev = list.get(index);
        let name = device_name(dev, index);
        unsafe {
            let ctx = ibverbs_sys::ibv_open_device(dev);
            drop(list);
            if ctx.is_null() {
                return Err(TransportError::fabric_with_source(
                    format!("RDMA: ibv_open_device({name}) failed"),
                    std::io::Error::last_os_error(),
                ));
            }

            let pd = ibverbs_sys::ibv_alloc_pd(ctx);
            if pd.is_null() {
                ibverbs_sys::ibv_close_device(ctx);
                return Err(TransportError::fabric(format!(
                    "RDMA: ibv_alloc_pd on {name} failed"
                )));
            }
            Ok(Self { ctx, pd, name })
        }
    }
}

impl Drop for VerbsDevice {
    fn drop(&mut self) {
        unsafe {
            if !self.pd.is_null() {
                ibverbs_sys::ibv_dealloc_pd(self.pd);
            }
            if !self.ctx.is_null() {
                ibverbs_sys::ibv_close_device(self.ctx);
            }
        }
    }
}

#[cfg(feature = "gpudirect")]
type GpuBinding = Option<super::cuda::CudaBinding>;
#[cfg(not(feature = "gpudirect"))]
type GpuBinding = ();

#[cfg(feature = "gpudirect")]
fn bind_gpu(ordinal: Option<usize>) -> Result<GpuBinding> {
    ordinal.map(super::cuda::CudaBinding::new).transpose()
}

#[cfg(not(feature = "gpudirect"))]
fn bind_gpu(ordinal: Option<usize>) -> Result<GpuBinding> {
    if let Some(ordinal) = ordinal {
        tracing::warn!(ordinal, "gpu_ordinal ignored: built without the `gpudirect` feature");
    }
    Ok(())
}

#[cfg(feature = "gpudirect")]
fn make_current(gpu: &GpuBinding) -> Result<()> {
    match gpu {
        Some(cuda) => cuda.bind(),
        None => Ok(()),
    }
}

#[cfg(not(feature = "gpudirect"))]
fn make_current(_gpu: &GpuBinding) -> Result<()> {
    Ok(())
}

/// An ibverbs device opened as a fabric.
pub struct VerbsFabric {
    device: Arc<VerbsDevice>,
    device_index: usize,
    gpu: GpuBinding,
}

impl VerbsFabric {
    /// Open RDMA device `device_index`. With GPUDirect, `gpu_ordinal` picks
    /// the CUDA context made current before each registration.
    pub fn open(device_index: usize, gpu_ordinal: Option<usize>) -> Result<Self> {
        let device = Arc::new(VerbsDevice::open(device_index)?);
        let gpu = bind_gpu(gpu_ordinal)?;
        tracing::info!(device = %device.name, index = device_index, "RDMA device opened");
        Ok(Self {
            device,
            device_index,
            gpu,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device.name
    }
}

struct VerbsMemory {
    mr: *mut ibverbs_sys::ibv_mr,
    _device: Arc<VerbsDevice>,
}

unsafe impl Send for VerbsMemory {}
unsafe impl Sync for VerbsMemory {}

impl RegisteredMemory for VerbsMemory {
    fn lkey(&self) -> u32 {
        unsafe { (*self.mr).lkey }
    }

    fn rkey(&self) -> u32 {
        unsafe { (*self.mr).rkey }
    }
}

impl Drop for VerbsMemory {
    fn drop(&mut self) {
        unsafe {
            if !self.mr.is_null() {
                ibverbs_sys::ibv_dereg_mr(self.mr);
            }
        }
    }
}

impl Fabric for VerbsFabric {
    fn kind(&self) -> FabricKind {
        FabricKind::Verbs {
            device_index: self.device_index,
        }
    }

    fn name(&self) -> &'static str {
        "verbs"
    }

    unsafe fn register(&self, addr: u64, len: u64) -> Result<Box<dyn RegisteredMemory>> {
        let size = usize::try_from(len).map_err(|_| {
            TransportError::Registration(format!("RDMA: region of {len} bytes is too large"))
        })?;
        make_current(&self.gpu)?;
        let mr = unsafe {
            ibverbs_sys::ibv_reg_mr(
                self.device.pd,
                addr as *mut _,
                size,
                remote_access().0 as c_int,
            )
        };
        if mr.is_null() {
            let os = std::io::Error::last_os_error();
            let hint = if cfg!(feature = "gpudirect") {
                " Is the nvidia-peermem kernel module loaded?"
            } else {
                ""
            };
            return Err(TransportError::Registration(format!(
                "RDMA: ibv_reg_mr failed for {addr:#x}+{len}: {os}.{hint}"
            )));
        }
        Ok(Box::new(VerbsMemory {
            mr,
            _device: Arc::clone(&self.device),
        }))
    }

    fn prepare<'a>(
        &'a self,
        _role: Role,
        _local: SocketAddr,
        _peer: SocketAddr,
        params: QueueParams,
    ) -> BoxFuture<'a, Result<Box<dyn PreparedQueuePair>>> {
        Box::pin(async move {
            let res = QpResources::create(&self.device, params)?;
            let endpoint = res.local_endpoint()?;
            tracing::debug!(qp_num = endpoint.qp_num, device = %self.device.name, "RDMA QP created");
            Ok(Box::new(PreparedVerbsQp { res, endpoint }) as Box<dyn PreparedQueuePair>)
        })
    }
}

/// Registered host buffer carved into fixed-size slots.
struct SlotPool {
    mr: *mut ibverbs_sys::ibv_mr,
    ptr: *mut u8,
    slots: usize,
    slot_size: usize,
}

impl SlotPool {
    fn new(device: &VerbsDevice, slots: usize, slot_size: usize) -> Result<Self> {
        let len = slots
            .checked_mul(slot_size)
            .ok_or_else(|| TransportError::fabric("RDMA: slot pool size overflows"))?;
        let ptr = Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8;
        let mr = unsafe {
            ibverbs_sys::ibv_reg_mr(
                device.pd,
                ptr as *mut _,
                len,
                ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0 as c_int,
            )
        };
        if mr.is_null() {
            unsafe {
                let _ = Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, len));
            }
            return Err(TransportError::fabric(format!(
                "RDMA: ibv_reg_mr failed for {len} byte slot pool"
            )));
        }
        Ok(Self {
            mr,
            ptr,
            slots,
            slot_size,
        })
    }

    fn lkey(&self) -> u32 {
        unsafe { (*self.mr).lkey }
    }

    fn addr(&self, slot: usize) -> u64 {
        self.ptr as u64 + (slot * self.slot_size) as u64
    }

    /// # Safety
    ///
    /// The NIC must not be writing into `slot`.
    unsafe fn slot(&self, slot: usize, len: usize) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.ptr.add(slot * self.slot_size),
                len.min(self.slot_size),
            )
        }
    }

    /// # Safety
    ///
    /// `slot` must not be posted.
    unsafe fn fill(&self, slot: usize, data: &[u8]) {
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.add(slot * self.slot_size),
                data.len(),
            );
        }
    }
}

impl Drop for SlotPool {
    fn drop(&mut self) {
        unsafe {
            if !self.mr.is_null() {
                ibverbs_sys::ibv_dereg_mr(self.mr);
            }
            if !self.ptr.is_null() {
                let len = self.slots * self.slot_size;
                let _ = Box::from_raw(ptr::slice_from_raw_parts_mut(self.ptr, len));
            }
        }
    }
}

/// CQ, QP and slot pools of one connection. Destroyed when the queue pair
/// and its poller have both let go.
struct QpResources {
    cq: *mut ibverbs_sys::ibv_cq,
    qp: *mut ibverbs_sys::ibv_qp,
    recv_pool: SlotPool,
    send_pool: SlotPool,
    free_send: ArrayQueue<usize>,
    /// Staging slot held by each in-flight send, by wr_id.
    send_in_use: Mutex<HashMap<u64, usize>>,
    device: Arc<VerbsDevice>,
}

unsafe impl Send for QpResources {}
unsafe impl Sync for QpResources {}

impl QpResources {
    fn create(device: &Arc<VerbsDevice>, params: QueueParams) -> Result<Self> {
        let recv_slots = (params.recv_depth as usize * 2).max(2);
        let send_slots = recv_slots.min(MAX_SEND_WR as usize);
        let slot_size = params.max_frame_bytes();

        let recv_pool = SlotPool::new(device, recv_slots, slot_size)?;
        let send_pool = SlotPool::new(device, send_slots, slot_size)?;
        let free_send = ArrayQueue::new(send_slots);
        for slot in 0..send_slots {
            let _ = free_send.push(slot);
        }

        let mut res = Self {
            cq: ptr::null_mut(),
            qp: ptr::null_mut(),
            recv_pool,
            send_pool,
            free_send,
            send_in_use: Mutex::new(HashMap::new()),
            device: Arc::clone(device),
        };

        unsafe {
            let cqe = (MAX_SEND_WR as usize + recv_slots) as c_int;
            res.cq = ibverbs_sys::ibv_create_cq(
                device.ctx,
                cqe,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            );
            if res.cq.is_null() {
                return Err(TransportError::fabric("RDMA: ibv_create_cq failed"));
            }

            let mut init: ibverbs_sys::ibv_qp_init_attr = std::mem::zeroed();
            init.qp_type = ibverbs_sys::ibv_qp_type::IBV_QPT_RC;
            init.send_cq = res.cq;
            init.recv_cq = res.cq;
            init.cap.max_send_wr = MAX_SEND_WR;
            init.cap.max_recv_wr = recv_slots as u32;
            init.cap.max_send_sge = 2;
            init.cap.max_recv_sge = 1;
            res.qp = ibverbs_sys::ibv_create_qp(device.pd, &mut init);
            if res.qp.is_null() {
                return Err(TransportError::fabric("RDMA: ibv_create_qp failed"));
            }

            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
            attr.pkey_index = 0;
            attr.port_num = PORT_NUM;
            attr.qp_access_flags = remote_access().0;
            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                | ibv_qp_attr_mask::IBV_QP_PORT
                | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
            let rc = ibverbs_sys::ibv_modify_qp(res.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(TransportError::fabric(format!(
                    "RDMA: ibv_modify_qp to INIT failed (rc={rc})"
                )));
            }
        }
        Ok(res)
    }

    fn local_endpoint(&self) -> Result<VerbsEndpoint> {
        unsafe {
            // RoCE routes by GID; LID 0 is fine there.
            let mut gid: ibverbs_sys::ibv_gid = std::mem::zeroed();
            let rc = ibverbs_sys::ibv_query_gid(self.device.ctx, PORT_NUM, 0, &mut gid);
            if rc != 0 {
                return Err(TransportError::fabric(format!(
                    "RDMA: ibv_query_gid failed (rc={rc})"
                )));
            }
            Ok(VerbsEndpoint {
                qp_num: (*self.qp).qp_num,
                lid: 0,
                gid: gid.raw,
            })
        }
    }

    fn connect(&self, remote: VerbsEndpoint) -> Result<()> {
        unsafe {
            // INIT -> RTR
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
            attr.path_mtu = ibverbs_sys::IBV_MTU_4096;
            attr.dest_qp_num = remote.qp_num;
            attr.rq_psn = 0;
            attr.max_dest_rd_atomic = 4;
            attr.min_rnr_timer = 12;
            attr.ah_attr.is_global = 1;
            attr.ah_attr.grh.dgid.raw = remote.gid;
            attr.ah_attr.grh.sgid_index = 0;
            attr.ah_attr.grh.hop_limit = 64;
            attr.ah_attr.grh.traffic_class = 0;
            attr.ah_attr.dlid = remote.lid;
            attr.ah_attr.sl = 0;
            attr.ah_attr.src_path_bits = 0;
            attr.ah_attr.port_num = PORT_NUM;
            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_AV
                | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(TransportError::fabric(format!(
                    "RDMA: ibv_modify_qp to RTR failed (rc={rc})"
                )));
            }

            // RTR -> RTS
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
            attr.sq_psn = 0;
            attr.timeout = 14;
            attr.retry_cnt = 7;
            attr.rnr_retry = 7;
            attr.max_rd_atomic = 4;
            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(TransportError::fabric(format!(
                    "RDMA: ibv_modify_qp to RTS failed (rc={rc})"
                )));
            }
        }
        Ok(())
    }

    fn post_send_wr(&self, wr: &mut ibverbs_sys::ibv_send_wr) -> Result<()> {
        unsafe {
            let post_send = (*(*self.qp).context)
                .ops
                .post_send
                .ok_or_else(|| TransportError::fabric("RDMA: post_send missing"))?;
            let mut bad_wr: *mut ibverbs_sys::ibv_send_wr = ptr::null_mut();
            let rc = post_send(self.qp, wr as *mut _, &mut bad_wr as *mut _);
            if rc != 0 {
                return Err(TransportError::fabric(format!(
                    "RDMA: post_send failed (rc={rc})"
                )));
            }
        }
        Ok(())
    }

    fn post_recv(&self, slot: usize) -> Result<()> {
        unsafe {
            let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
            sge.addr = self.recv_pool.addr(slot);
            sge.length = self.recv_pool.slot_size as u32;
            sge.lkey = self.recv_pool.lkey();

            let mut wr: ibverbs_sys::ibv_recv_wr = std::mem::zeroed();
            wr.wr_id = RECV_WR_TAG | slot as u64;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;

            let post_recv = (*(*self.qp).context)
                .ops
                .post_recv
                .ok_or_else(|| TransportError::fabric("RDMA: post_recv missing"))?;
            let mut bad_wr: *mut ibverbs_sys::ibv_recv_wr = ptr::null_mut();
            let rc = post_recv(self.qp, &mut wr as *mut _, &mut bad_wr as *mut _);
            if rc != 0 {
                return Err(TransportError::fabric(format!(
                    "RDMA: post_recv failed (rc={rc})"
                )));
            }
        }
        Ok(())
    }

    fn post_rdma(&self, op: OpKind, wr_id: u64, local: LocalSge, remote: RemoteSge) -> Result<()> {
        let length = u32::try_from(local.length).map_err(|_| {
            TransportError::operation(op, format!("{} bytes exceed one work request", local.length))
        })?;
        unsafe {
            let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
            sge.addr = local.addr;
            sge.length = length;
            sge.lkey = local.lkey;

            let mut wr: ibverbs_sys::ibv_send_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.opcode = match op {
                OpKind::Read => ibv_wr_opcode::IBV_WR_RDMA_READ,
                _ => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            };
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            wr.wr.rdma.remote_addr = remote.addr;
            wr.wr.rdma.rkey = remote.rkey;
            self.post_send_wr(&mut wr)
        }
    }

    fn post_message(&self, wr_id: u64, inline: &[u8], gather: Option<LocalSge>) -> Result<()> {
        let total = inline.len() as u64 + gather.map_or(0, |g| g.length);
        if inline.len() > self.send_pool.slot_size || total > self.recv_pool.slot_size as u64 {
            return Err(TransportError::operation(
                OpKind::Send,
                format!("{total} byte message exceeds the receive slot size"),
            ));
        }
        let slot = self.free_send.pop().ok_or_else(|| {
            TransportError::operation(OpKind::Send, "RDMA: send staging slots exhausted")
        })?;

        let result = unsafe {
            self.send_pool.fill(slot, inline);
            let mut sges: [ibverbs_sys::ibv_sge; 2] = std::mem::zeroed();
            sges[0].addr = self.send_pool.addr(slot);
            sges[0].length = inline.len() as u32;
            sges[0].lkey = self.send_pool.lkey();
            let mut num_sge = 1;
            if let Some(g) = gather {
                sges[1].addr = g.addr;
                sges[1].length = g.length as u32;
                sges[1].lkey = g.lkey;
                num_sge = 2;
            }

            let mut wr: ibverbs_sys::ibv_send_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = sges.as_mut_ptr();
            wr.num_sge = num_sge;
            wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;

            self.send_in_use
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(wr_id, slot);
            self.post_send_wr(&mut wr)
        };
        if result.is_err() {
            self.release_send_slot(wr_id);
        }
        result
    }

    fn release_send_slot(&self, wr_id: u64) {
        let slot = self
            .send_in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&wr_id);
        if let Some(slot) = slot {
            let _ = self.free_send.push(slot);
        }
    }

    /// Handle one work completion. `Err` means the queue pair is dead.
    fn on_completion(
        &self,
        wc: &ibverbs_sys::ibv_wc,
        events: &mpsc::UnboundedSender<CompletionEvent>,
    ) -> std::result::Result<(), String> {
        let wr_id = wc.wr_id();
        if wr_id & RECV_WR_TAG != 0 {
            if let Some((status, vendor_err)) = wc.error() {
                return Err(format!(
                    "RDMA: receive failed (status={status:?}, vendor_err={vendor_err})"
                ));
            }
            let slot = (wr_id & !RECV_WR_TAG) as usize;
            // SAFETY: the slot is not posted until the repost below.
            let data = Bytes::copy_from_slice(unsafe { self.recv_pool.slot(slot, wc.len()) });
            let _ = events.send(CompletionEvent::Recv(data));
            return self.post_recv(slot).map_err(|e| e.to_string());
        }

        self.release_send_slot(wr_id);
        match wc.error() {
            None => {
                let _ = events.send(CompletionEvent::Work(WorkCompletion {
                    wr_id,
                    status: WcStatus::Success,
                }));
                Ok(())
            }
            Some((status, vendor_err)) => {
                let mapped = if status == ibv_wc_status::IBV_WC_REM_ACCESS_ERR {
                    WcStatus::RemoteAccess
                } else if status == ibv_wc_status::IBV_WC_LOC_PROT_ERR {
                    WcStatus::LocalAccess
                } else if status == ibv_wc_status::IBV_WC_WR_FLUSH_ERR {
                    WcStatus::Flushed
                } else {
                    WcStatus::Failed(format!("status={status:?}, vendor_err={vendor_err}"))
                };
                let _ = events.send(CompletionEvent::Work(WorkCompletion {
                    wr_id,
                    status: mapped,
                }));
                // An RC queue pair enters the error state on its first failed
                // request; everything behind it is flushed.
                Err(format!(
                    "RDMA: work request {wr_id} failed (status={status:?}, vendor_err={vendor_err})"
                ))
            }
        }
    }
}

impl Drop for QpResources {
    fn drop(&mut self) {
        unsafe {
            if !self.qp.is_null() {
                ibverbs_sys::ibv_destroy_qp(self.qp);
            }
            if !self.cq.is_null() {
                ibverbs_sys::ibv_destroy_cq(self.cq);
            }
        }
    }
}

struct PreparedVerbsQp {
    res: QpResources,
    endpoint: VerbsEndpoint,
}

impl PreparedQueuePair for PreparedVerbsQp {
    fn endpoint(&self) -> Bytes {
        self.endpoint.to_bytes()
    }

    fn complete(
        self: Box<Self>,
        remote: Bytes,
        _timeout: Duration,
    ) -> BoxFuture<'static, Result<ConnectedQueuePair>> {
        let this = *self;
        Box::pin(async move {
            let remote = VerbsEndpoint::from_bytes(&remote)?;
            this.res.connect(remote)?;
            let res = Arc::new(this.res);
            for slot in 0..res.recv_pool.slots {
                res.post_recv(slot)?;
            }

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let stop = Arc::new(AtomicBool::new(false));
            {
                let res = Arc::clone(&res);
                let stop = Arc::clone(&stop);
                tokio::task::spawn_blocking(move || poll_loop(res, stop, events_tx));
            }
            tracing::debug!(
                local_qp = this.endpoint.qp_num,
                remote_qp = remote.qp_num,
                "RDMA QP connected"
            );
            Ok(ConnectedQueuePair {
                qp: Box::new(VerbsQueuePair { res, stop }),
                completions: events_rx,
            })
        })
    }
}

/// A connected RC queue pair.
pub struct VerbsQueuePair {
    res: Arc<QpResources>,
    stop: Arc<AtomicBool>,
}

impl QueuePair for VerbsQueuePair {
    fn post(&self, wr: WorkRequest) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionLost(
                "RDMA queue pair disconnected".into(),
            ));
        }
        match wr {
            WorkRequest::Write {
                wr_id,
                local,
                remote,
            } => self.res.post_rdma(OpKind::Write, wr_id, local, remote),
            WorkRequest::Read {
                wr_id,
                local,
                remote,
            } => self.res.post_rdma(OpKind::Read, wr_id, local, remote),
            WorkRequest::Send {
                wr_id,
                inline,
                gather,
            } => self.res.post_message(wr_id, &inline, gather),
        }
    }

    fn send_slots(&self) -> Option<usize> {
        Some(self.res.send_pool.slots)
    }

    fn disconnect(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl Drop for VerbsQueuePair {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Drain the CQ until stopped or the queue pair fails. Dropping `events`
/// on exit closes the completion stream.
fn poll_loop(
    res: Arc<QpResources>,
    stop: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<CompletionEvent>,
) {
    let poll_cq = unsafe { (*(*res.cq).context).ops.poll_cq };
    let Some(poll_cq) = poll_cq else {
        let _ = events.send(CompletionEvent::Fatal("RDMA: poll_cq missing".into()));
        return;
    };
    let mut wcs: [ibverbs_sys::ibv_wc; POLL_BATCH] =
        std::array::from_fn(|_| ibverbs_sys::ibv_wc::default());
    let mut idle = 0u32;

    let reason = 'poll: loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let n = unsafe { poll_cq(res.cq, POLL_BATCH as c_int, wcs.as_mut_ptr()) };
        if n < 0 {
            break "RDMA: poll_cq failed".to_string();
        }
        if n == 0 {
            // Tiered backoff: spin, then short sleeps, then longer ones.
            if idle < 1000 {
                std::hint::spin_loop();
            } else if idle < 5000 {
                std::thread::sleep(Duration::from_micros(10));
            } else {
                std::thread::sleep(Duration::from_micros(100));
            }
            idle = idle.saturating_add(1);
            continue;
        }
        idle = 0;
        for wc in &wcs[..n as usize] {
            if let Err(reason) = res.on_completion(wc, &events) {
                break 'poll reason;
            }
        }
    };
    tracing::warn!("RDMA completion poller stopped: {reason}");
    let _ = events.send(CompletionEvent::Fatal(reason));
}
