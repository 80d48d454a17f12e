pub mod control;
pub mod state;

pub use control::{
    ControlChannel, ControlReader, ControlWriter, control_accept, control_connect, control_listen,
};
pub use state::StateMachine;
