pub mod listener;
pub mod transport;

pub use transport::{serve, Tunnel, TunnelState};
