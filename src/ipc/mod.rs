//! IPC frame protocol and the Unix-domain socket glue that carries it
//! between a forwarder and the server (C7).

pub mod frame;
pub mod socket;

pub use frame::{Frame, FrameDecoder, FrameError, FrameType, SubscribeFlags};
