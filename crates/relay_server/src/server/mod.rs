//! Relay server core: listeners, per-connection and per-datagram flows,
//! periodic sweeps and the ordered shutdown sequence.

mod core;
mod listener;
mod state;
mod sweep;
mod tcp;
mod udp;

pub use self::core::{BoundAddrs, RelayServer};
