//! Point-to-point RDMA transport for moving tensor buffers between hosts.
//!
//! A [`Session`] owns a set of registered memory regions (its
//! [`BufferSet`]) and connects to exactly one peer. The handshake swaps
//! BufferSets over a TCP control channel; afterwards the data path offers
//! one-sided writes and reads against the peer's regions and a two-sided,
//! FIFO-ordered [`Envelope`] stream with credit-based backpressure.
//!
//! # Features
//!
//! - **default**: software fabric only. Queue pairs are emulated over TCP,
//!   so everything runs without RDMA hardware.
//! - **verbs**: InfiniBand/RoCE fabric via raw ibverbs
//!   (`FabricKind::Verbs`).
//! - **gpudirect**: binds a CUDA context before registration so device
//!   pointers can be handed to the NIC.
//!
//! # Usage
//!
//! ```ignore
//! use tensorlink::{Session, TransportConfig};
//!
//! let server = Session::new("0.0.0.0:7000".parse()?, TransportConfig::from_env())?;
//! unsafe { server.register_buffer(buf.as_ptr() as u64, 0, buf.len() as u64)? };
//! server.listen().await?;
//!
//! // elsewhere
//! let client = Session::new("0.0.0.0:0".parse()?, TransportConfig::from_env())?;
//! let remote = client.connect(server_addr).await?;
//! client.recv(0usize, 0usize).await?; // pull remote region 0 into local region 0
//! client.send(0, 1024, "kv-block").await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod fabric;
pub mod memory;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

pub use config::{FabricKind, TransportConfig};
pub use engine::PendingOperation;
pub use error::{Result, TransportError};
pub use memory::{AccessKey, BufferSet, MemoryRegion};
pub use protocol::{Envelope, EnvelopeKind};
pub use session::{ConnectionInfo, Session};
pub use types::{ConnectionState, OpKind, RegionSlice, Role, SendMode};
