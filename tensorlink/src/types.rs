use std::fmt;

/// Wire protocol version exchanged in the handshake hello.
pub const PROTOCOL_VERSION: u16 = 1;

/// Lifecycle of a session's connection.
///
/// ```text
/// Idle -> Connecting -> Handshaking -> Established -> Closing -> Closed
/// ```
///
/// Any state may jump straight to `Closed` when a step fails. `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Handshaking = 2,
    Established = 3,
    Closing = 4,
    Closed = 5,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Handshaking)
                | (Handshaking, Established)
                | (Idle | Connecting | Handshaking | Established, Closing)
                | (Idle | Connecting | Handshaking | Established | Closing, Closed)
        )
    }

    /// Connection teardown has started or finished.
    pub fn is_closing(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Established => "established",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Which side of the control channel a session is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the peer with `connect`.
    Client,
    /// Accepted the peer after `listen`.
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Kind of a posted data-path operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// One-sided RDMA write into peer memory.
    Write,
    /// One-sided RDMA read from peer memory.
    Read,
    /// Two-sided send consumed by the peer's receive queue.
    Send,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Write => f.write_str("RDMA write"),
            OpKind::Read => f.write_str("RDMA read"),
            OpKind::Send => f.write_str("send"),
        }
    }
}

/// How `Session::send` moves a local region to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    /// Copy the region into a message consumed by the peer's `recv_message`.
    #[default]
    TwoSided,
    /// Write the region into the peer's region of the same index, then post
    /// a write notice.
    OneSided,
}

impl SendMode {
    /// Parse `"one-sided"` / `"two-sided"` (case-insensitive, `_` allowed).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "two-sided" | "twosided" | "send" => Some(SendMode::TwoSided),
            "one-sided" | "onesided" | "write" => Some(SendMode::OneSided),
            _ => None,
        }
    }
}

/// A byte range within a registered region, addressed by BufferSet index.
///
/// `offset` is relative to the region's start (`base_address + offset` of the
/// region). A `length` of `None` means "through the end of the region".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSlice {
    pub index: usize,
    pub offset: u64,
    pub length: Option<u64>,
}

impl RegionSlice {
    /// The whole region at `index`.
    pub fn whole(index: usize) -> Self {
        Self {
            index,
            offset: 0,
            length: None,
        }
    }

    /// `length` bytes starting `offset` bytes into the region at `index`.
    pub fn range(index: usize, offset: u64, length: u64) -> Self {
        Self {
            index,
            offset,
            length: Some(length),
        }
    }
}

impl From<usize> for RegionSlice {
    fn from(index: usize) -> Self {
        Self::whole(index)
    }
}
