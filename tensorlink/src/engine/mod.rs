pub mod completion;
pub mod data_channel;

pub use completion::{PendingOperation, PendingTable};
pub use data_channel::{DataChannel, DataChannelParams};
