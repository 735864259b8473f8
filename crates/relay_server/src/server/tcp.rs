//! Per-connection TCP flow.
//!
//! accept → session + resource → gate → read loop → teardown. Each inbound
//! chunk becomes one message, processed in arrival order.

use relay_core::{
    ErrorContext, MessageContext, Protocol, Resource, RouterError, TransportHandle,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::state::{tcp_resource_id, ConnectionSlot, RelayState, TCP_RESOURCE_TYPE};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) async fn accept_loop(
    listener: TcpListener,
    state: Arc<RelayState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("TCP accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state_for_task = state.clone();
                    let mut connections = state.connections.lock().await;
                    while connections.try_join_next().is_some() {}
                    connections.spawn(handle_connection(stream, peer, state_for_task));
                }
                Err(e) => {
                    let context = ErrorContext::new().component("tcp").operation("accept");
                    state.errors.handle_error(e, &context);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    PeerClosed,
    IdleTimeout,
    Disposed,
    ReadError,
    SessionGone,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::Disposed => "disposed",
            CloseReason::ReadError => "read error",
            CloseReason::SessionGone => "session removed",
        }
    }
}

pub(crate) async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<RelayState>) {
    let Some(_slot) = ConnectionSlot::acquire(&state) else {
        warn!(peer = %peer, max = state.config.max_connections, "🚫 Connection limit reached, rejecting");
        return;
    };

    let session_id = state.sessions.create_session(peer);
    let resource_id = tcp_resource_id(&session_id);
    let closer = Arc::new(Notify::new());
    let notify = closer.clone();
    state.resources.register(
        Resource::new(resource_id.clone(), TCP_RESOURCE_TYPE, move || {
            notify.notify_one();
            Ok(())
        })
        .with_metadata("peer", peer.to_string()),
    );

    if !state.connection_gate.check(peer.ip(), Protocol::Tcp).is_allowed() {
        state.resources.dispose(&resource_id);
        state.sessions.remove(&session_id);
        return;
    }

    info!(session_id = %session_id, peer = %peer, "🔗 TCP connection opened");
    if let Err(e) = stream.set_nodelay(true) {
        debug!(session_id = %session_id, "Failed to set TCP_NODELAY: {}", e);
    }

    let (mut reader, mut writer) = stream.into_split();
    let (transport, mut outbound) = TransportHandle::channel();
    let mut writer_task = {
        let sessions = state.sessions.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            while let Some(bytes) = outbound.recv().await {
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!(session_id = %session_id, "Write failed: {}", e);
                    break;
                }
                sessions.record_outbound(&session_id, bytes.len());
            }
            let _ = writer.shutdown().await;
        })
    };

    let mut buf = vec![0u8; state.config.read_buffer_size.max(1)];
    let reason = loop {
        let read = tokio::select! {
            _ = closer.notified() => break CloseReason::Disposed,
            read = timeout(state.config.idle_timeout, reader.read(&mut buf)) => read,
        };

        let n = match read {
            Err(_) => break CloseReason::IdleTimeout,
            Ok(Ok(0)) => break CloseReason::PeerClosed,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                let context = ErrorContext::for_session(session_id.clone(), Protocol::Tcp)
                    .component("tcp")
                    .operation("read");
                state.errors.handle_error(RouterError::from(e), &context);
                break CloseReason::ReadError;
            }
        };

        state.sessions.record_inbound(&session_id, n);
        let ctx = MessageContext::new(
            session_id.clone(),
            Protocol::Tcp,
            peer,
            buf[..n].to_vec(),
            transport.clone(),
        );
        state.dispatch(ctx).await;

        // The connection may have been torn down while the pipeline ran.
        if !state.sessions.contains(&session_id) {
            break CloseReason::SessionGone;
        }
        if state.resources.is_disposed(&resource_id) != Some(false) {
            break CloseReason::Disposed;
        }
    };

    state.resources.dispose(&resource_id);
    state.security.release_connection(peer.ip());
    state.sessions.remove(&session_id);

    drop(transport);
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
        error!(session_id = %session_id, "Writer did not drain in time");
        writer_task.abort();
    }

    info!(
        session_id = %session_id,
        peer = %peer,
        reason = reason.as_str(),
        "🔌 TCP connection closed"
    );
}
