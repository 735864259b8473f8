//! Listener construction.
//!
//! TCP listeners are built through `socket2` so `SO_REUSEPORT` can be set
//! before binding, letting several accept loops share one port.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{info, warn};

use crate::error::ServerError;

const LISTEN_BACKLOG: i32 = 1024;

/// Bind `acceptors` TCP listeners on `addr`.
///
/// When `reuse_port` is off only one listener is created. With an ephemeral
/// port the first listener's resolved address is reused for the rest so they
/// all share the same port.
pub(crate) fn bind_tcp_listeners(
    addr: SocketAddr,
    reuse_port: bool,
    acceptors: usize,
) -> Result<Vec<TcpListener>, ServerError> {
    let count = if reuse_port { acceptors.max(1) } else { 1 };
    let mut listeners = Vec::with_capacity(count);
    let mut target = addr;

    for i in 0..count {
        let listener = bind_tcp(target, reuse_port)?;
        if i == 0 {
            target = listener
                .local_addr()
                .map_err(|source| ServerError::Bind { addr, source })?;
        }
        info!("✅ TCP listener {} bound on {}", i, target);
        listeners.push(listener);
    }
    Ok(listeners)
}

fn bind_tcp(addr: SocketAddr, reuse_port: bool) -> Result<TcpListener, ServerError> {
    let bind_err = |source| ServerError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    if let Err(e) = socket.set_reuse_address(true) {
        warn!("Failed to set SO_REUSEADDR on {}: {}", addr, e);
    }
    if reuse_port {
        enable_reuse_port(&socket);
    }

    socket.bind(&SockAddr::from(addr)).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let std_listener: StdTcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(bind_err)
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin"))))]
fn enable_reuse_port(socket: &Socket) {
    match socket.set_reuse_port(true) {
        Ok(()) => info!("SO_REUSEPORT enabled for load balancing across acceptors"),
        Err(e) => warn!("Failed to set SO_REUSEPORT: {}", e),
    }
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin")))))]
fn enable_reuse_port(_socket: &Socket) {
    warn!("SO_REUSEPORT is not supported on this platform. Using SO_REUSEADDR only.");
}

pub(crate) async fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, ServerError> {
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    if let Ok(local) = socket.local_addr() {
        info!("✅ UDP socket bound on {}", local);
    }
    Ok(socket)
}
