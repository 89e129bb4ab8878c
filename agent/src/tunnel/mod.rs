pub mod transport;

pub use transport::{open, OpenParams, Tunnel, TunnelState};
