pub mod envelope;
pub mod handshake;

pub use envelope::{ENVELOPE_HEADER_SIZE, Envelope, EnvelopeKind};
pub use handshake::{ControlFrame, Hello};
