//! The unit of work flowing through the pipeline.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::{ErrorContext, RouterError};
use crate::session::Protocol;

/// Write side of whatever delivered the message.
#[derive(Debug, Clone)]
pub enum TransportHandle {
    /// Outbound queue drained by the connection's writer task.
    Stream(mpsc::UnboundedSender<Vec<u8>>),
    /// Shared UDP socket plus the peer to answer.
    Datagram {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
    /// Nothing to reply on.
    Detached,
}

impl TransportHandle {
    /// In-memory stream handle, mostly for tests and embedding.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransportHandle::Stream(tx), rx)
    }

    pub async fn send(&self, bytes: &[u8]) -> Result<usize, RouterError> {
        match self {
            TransportHandle::Stream(tx) => {
                tx.send(bytes.to_vec()).map_err(|_| {
                    RouterError::connection("connection writer closed").with_retryable(false)
                })?;
                Ok(bytes.len())
            }
            TransportHandle::Datagram { socket, peer } => Ok(socket.send_to(bytes, *peer).await?),
            TransportHandle::Detached => {
                Err(RouterError::connection("no transport attached").with_retryable(false))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageContext {
    pub session_id: String,
    pub protocol: Protocol,
    pub payload: Vec<u8>,
    pub remote_address: IpAddr,
    pub remote_port: u16,
    pub metadata: HashMap<String, String>,
    pub transport: TransportHandle,
}

impl MessageContext {
    pub fn new(
        session_id: impl Into<String>,
        protocol: Protocol,
        remote: SocketAddr,
        payload: Vec<u8>,
        transport: TransportHandle,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            protocol,
            payload,
            remote_address: remote.ip(),
            remote_port: remote.port(),
            metadata: HashMap::new(),
            transport,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.remote_address, self.remote_port)
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Write `bytes` back to the sender.
    pub async fn reply(&self, bytes: &[u8]) -> Result<usize, RouterError> {
        self.transport.send(bytes).await
    }

    pub fn error_context(&self) -> ErrorContext {
        ErrorContext::for_session(self.session_id.clone(), self.protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_reply_reaches_writer() {
        let (transport, mut rx) = TransportHandle::channel();
        let ctx = MessageContext::new(
            "s-1",
            Protocol::Tcp,
            "127.0.0.1:9000".parse().unwrap(),
            b"hi".to_vec(),
            transport,
        );

        assert_eq!(ctx.reply(b"hello").await.unwrap(), 5);
        assert_eq!(rx.recv().await.unwrap(), b"hello");

        drop(rx);
        let err = ctx.reply(b"late").await.unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_detached_transport_refuses_replies() {
        let ctx = MessageContext::new(
            "s-2",
            Protocol::Udp,
            "[::1]:53".parse().unwrap(),
            Vec::new(),
            TransportHandle::Detached,
        );
        assert!(ctx.reply(b"x").await.is_err());
        assert_eq!(ctx.remote().port(), 53);
        assert_eq!(ctx.error_context().protocol, Some(Protocol::Udp));
    }
}
