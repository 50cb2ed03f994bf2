use super::{TransportEvent, TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE};
use crate::message::{parse_message, SipMessage};
use crate::{Error, Result};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace};

struct UdpInner {
    socket: UdpSocket,
    local: SocketAddr,
}

/// Datagram transport: one datagram is one SIP message, no framing.
#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

impl UdpConnection {
    pub async fn create_connection(local: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        let local = socket.local_addr()?;
        let connection = UdpConnection {
            inner: Arc::new(UdpInner { socket, local }),
        };
        info!("created UDP transport: {}", connection);
        Ok(connection)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    pub async fn send_message(
        &self,
        msg: &SipMessage,
        destination: Option<SocketAddr>,
    ) -> Result<()> {
        let target = destination
            .ok_or_else(|| Error::Transport("UDP send without destination".to_string()))?;
        let buf = msg.to_bytes();
        trace!("sending {} bytes {} -> {}", buf.len(), self.inner.local, target);
        self.inner
            .socket
            .send_to(&buf, target)
            .await
            .map_err(|e| Error::Transport(format!("UDP send to {}: {}", target, e)))
            .map(|_| ())
    }

    pub async fn send_raw(&self, data: &[u8], destination: SocketAddr) -> Result<()> {
        self.inner
            .socket
            .send_to(data, destination)
            .await
            .map_err(|e| Error::Transport(format!("UDP send to {}: {}", destination, e)))
            .map(|_| ())
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, addr) = match self.inner.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    error!("error receiving UDP packet: {}", e);
                    continue;
                }
            };

            // CRLF keepalives are noise on the datagram transport
            if buf[..len] == *KEEPALIVE_REQUEST || buf[..len] == *KEEPALIVE_RESPONSE {
                continue;
            }

            let msg = match parse_message(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("dropping undecodable datagram from {}: {}", addr, e);
                    continue;
                }
            };
            trace!("received {} bytes from {}", len, addr);
            sender.send(TransportEvent::Incoming(msg, addr))?;
        }
    }
}

impl std::fmt::Display for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.local)
    }
}
