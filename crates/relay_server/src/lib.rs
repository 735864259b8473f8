//! # Relay Server
//!
//! TCP and UDP transport integration for the relay gateway. The server owns
//! no message semantics of its own: every inbound chunk or datagram becomes a
//! [`MessageContext`](relay_core::MessageContext) that runs through the
//! plugin chain and then the router.
//!
//! ## Message Flow
//!
//! 1. A TCP connection is accepted, or a UDP datagram arrives
//! 2. A session is created (TCP) or looked up by `address:port` (UDP) and a
//!    resource is registered for it
//! 3. The security gate runs: IP filter, rate limit and, for TCP, the
//!    per-IP connection limit
//! 4. The pipeline runs under the retry policy: plugins, then the router
//! 5. Replies go back through the message's transport handle
//! 6. On close, error or idle timeout the resource is disposed, the
//!    connection slot released and the session removed
//!
//! ## Maintenance
//!
//! Background sweeps evict idle UDP sessions, purge disposed resources and
//! purge expired security state.
//!
//! ## Shutdown
//!
//! [`RelayServer::shutdown`] stops accepting, force-disposes connection
//! resources, clears the session store, shuts plugins down and finally runs
//! the registry's dispose-all.

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::{BoundAddrs, RelayServer};
pub use stats::ServerStats;
pub use utils::create_server_with_config;

pub mod config;
pub mod error;
pub mod server;
pub mod stats;
pub mod utils;
