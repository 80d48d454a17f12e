//! Runtime-configurable parameters for a transport session.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `TENSORLINK_`) or by constructing a custom `TransportConfig`.

use crate::types::SendMode;
use std::time::Duration;

/// Which provider backs the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FabricKind {
    /// Queue-pair emulation over a dedicated TCP stream. Runs anywhere.
    #[default]
    Soft,
    /// InfiniBand/RoCE through ibverbs (`verbs` feature).
    Verbs { device_index: usize },
}

impl FabricKind {
    /// Identifier carried in the handshake hello. Both peers must agree.
    pub fn wire_id(self) -> u8 {
        match self {
            FabricKind::Soft => 1,
            FabricKind::Verbs { .. } => 2,
        }
    }
}

/// Tuning parameters for a session.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound on `connect` and on the server side of a handshake,
    /// covering the TCP dial and the full exchange.
    pub connect_timeout: Duration,

    /// A posted operation that has not completed within this window fails
    /// with an operation error. The connection stays up.
    pub operation_timeout: Duration,

    /// How long `shutdown` waits for in-flight operations before cancelling
    /// the rest with a connection-lost error.
    pub drain_timeout: Duration,

    /// Receive credits advertised to the peer for two-sided messages.
    pub recv_queue_depth: u32,

    /// Largest tag + payload accepted in a single message.
    pub max_message_bytes: usize,

    /// Largest single memory registration.
    pub max_registration_bytes: u64,

    /// How `Session::send` moves data.
    pub send_mode: SendMode,

    /// Tags remembered for `Session::is_complete`. The oldest is forgotten
    /// first.
    pub completion_history: usize,

    /// Data channel provider.
    pub fabric: FabricKind,

    /// CUDA device whose primary context is bound before registration.
    pub gpu_ordinal: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
            recv_queue_depth: 32,
            max_message_bytes: 1024 * 1024,                // 1 MiB
            max_registration_bytes: 64 * 1024 * 1024 * 1024, // 64 GiB
            send_mode: SendMode::TwoSided,
            completion_history: 1024,
            fabric: FabricKind::Soft,
            gpu_ordinal: None,
        }
    }
}

impl TransportConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `TENSORLINK_CONNECT_TIMEOUT_MS`
    /// - `TENSORLINK_OPERATION_TIMEOUT_MS`
    /// - `TENSORLINK_DRAIN_TIMEOUT_MS`
    /// - `TENSORLINK_RECV_QUEUE_DEPTH`
    /// - `TENSORLINK_MAX_MESSAGE_BYTES`
    /// - `TENSORLINK_MAX_REGISTRATION_BYTES`
    /// - `TENSORLINK_SEND_MODE` (`one-sided` / `two-sided`)
    /// - `TENSORLINK_COMPLETION_HISTORY`
    /// - `TENSORLINK_FABRIC` (`soft` / `verbs`)
    /// - `TENSORLINK_RDMA_DEVICE` (ibverbs device index, implies `verbs`)
    /// - `TENSORLINK_GPU_ORDINAL`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(v) = var("TENSORLINK_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.connect_timeout = Duration::from_millis(ms);
            }
        }
        if let Some(v) = var("TENSORLINK_OPERATION_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.operation_timeout = Duration::from_millis(ms);
            }
        }
        if let Some(v) = var("TENSORLINK_DRAIN_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.drain_timeout = Duration::from_millis(ms);
            }
        }
        if let Some(v) = var("TENSORLINK_RECV_QUEUE_DEPTH") {
            if let Ok(n) = v.parse::<u32>() {
                if n > 0 {
                    cfg.recv_queue_depth = n;
                }
            }
        }
        if let Some(v) = var("TENSORLINK_MAX_MESSAGE_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.max_message_bytes = n;
            }
        }
        if let Some(v) = var("TENSORLINK_MAX_REGISTRATION_BYTES") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.max_registration_bytes = n;
            }
        }
        if let Some(v) = var("TENSORLINK_SEND_MODE") {
            if let Some(mode) = SendMode::parse(&v) {
                cfg.send_mode = mode;
            }
        }
        if let Some(v) = var("TENSORLINK_COMPLETION_HISTORY") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    cfg.completion_history = n;
                }
            }
        }
        let device_index = var("TENSORLINK_RDMA_DEVICE").and_then(|v| v.parse::<usize>().ok());
        match var("TENSORLINK_FABRIC").as_deref().map(str::trim) {
            Some("soft") => cfg.fabric = FabricKind::Soft,
            Some("verbs") | Some("rdma") => {
                cfg.fabric = FabricKind::Verbs {
                    device_index: device_index.unwrap_or(0),
                }
            }
            _ => {
                if let Some(idx) = device_index {
                    cfg.fabric = FabricKind::Verbs { device_index: idx };
                }
            }
        }
        if let Some(v) = var("TENSORLINK_GPU_ORDINAL") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.gpu_ordinal = Some(n);
            }
        }

        cfg
    }
}
