pub mod datagram;
pub mod heartbeat;
pub mod registry;
pub mod relay;
pub mod session;
pub mod udp;

pub use session::{Client, SessionError};
