//! Datagram flow.
//!
//! UDP has no connection to own, so a session is a logical grouping per
//! `address:port` backed by a logical resource. The security gate runs before
//! the session is looked up. Idle groupings are evicted by the UDP sweep.

use relay_core::{ErrorContext, MessageContext, Protocol, Resource, TransportHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::debug;

use super::state::{udp_resource_id, RelayState, UDP_RESOURCE_TYPE};

pub(crate) async fn receive_loop(
    socket: Arc<UdpSocket>,
    state: Arc<RelayState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; state.config.max_datagram_size.max(1)];
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("UDP receive loop stopping");
                break;
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, peer)) => {
                    let payload = buf[..n].to_vec();
                    let mut datagrams = state.datagrams.lock().await;
                    while datagrams.try_join_next().is_some() {}
                    datagrams.spawn(handle_datagram(payload, peer, socket.clone(), state.clone()));
                }
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some
                    // platforms; the socket itself stays usable.
                    let context = ErrorContext::new().component("udp").operation("recv_from");
                    state.errors.handle_error(e, &context);
                }
            }
        }
    }
}

pub(crate) async fn handle_datagram(
    payload: Vec<u8>,
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    state: Arc<RelayState>,
) {
    // Gate before lookup: a denied datagram must not refresh the session.
    if !state.datagram_gate.check(peer.ip(), Protocol::Udp).is_allowed() {
        return;
    }

    let (session_id, created) = state.sessions.get_or_create_for_datagram(peer);
    if created {
        state.resources.register(
            Resource::logical(udp_resource_id(&session_id), UDP_RESOURCE_TYPE)
                .with_metadata("peer", peer.to_string()),
        );
        debug!(session_id = %session_id, peer = %peer, "📨 UDP session created");
    }

    state.sessions.record_inbound(&session_id, payload.len());
    let ctx = MessageContext::new(
        session_id.clone(),
        Protocol::Udp,
        peer,
        payload,
        TransportHandle::Datagram { socket, peer },
    );
    state.dispatch(ctx).await;

    if !state.sessions.contains(&session_id) {
        debug!(session_id = %session_id, "UDP session evicted while its datagram was processed");
    }
}
