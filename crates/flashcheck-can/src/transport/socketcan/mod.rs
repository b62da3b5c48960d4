//! SocketCAN transport (Linux only)

mod channel;

pub use channel::{SocketCanChannel, SocketCanProvider};
