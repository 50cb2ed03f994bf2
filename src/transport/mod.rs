pub mod channel;
pub mod stream;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use channel::ChannelConnection;
pub use stream::{SipFramer, StreamConnection};
pub use tcp::TcpConnection;
pub use tls::TlsConnection;
pub use udp::UdpConnection;

use crate::message::SipMessage;
use crate::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// How long a TCP connect / TLS handshake may take before giving up.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// What a connection delivers upward: whole parsed messages with their
/// source, and a terminal notice when a stream dies.
#[derive(Debug)]
pub enum TransportEvent {
    Incoming(SipMessage, SocketAddr),
    Closed,
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

/// The one transport a user agent signals over. Datagram and stream
/// variants share the contract: `send` writes one whole message, and
/// `serve_loop` pushes [`TransportEvent`]s until cancelled or dead.
#[derive(Clone)]
pub enum Connection {
    Udp(UdpConnection),
    Tcp(TcpConnection),
    Tls(TlsConnection),
    Channel(ChannelConnection),
}

impl Connection {
    /// `destination` is required by UDP and ignored by the stream variants,
    /// which are already connected to the server.
    pub async fn send(&self, msg: &SipMessage, destination: Option<SocketAddr>) -> Result<()> {
        match self {
            Connection::Udp(t) => t.send_message(msg, destination).await,
            Connection::Tcp(t) => t.send_message(msg).await,
            Connection::Tls(t) => t.send_message(msg).await,
            Connection::Channel(t) => t.send_message(msg).await,
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            Connection::Udp(t) => t.serve_loop(sender).await,
            Connection::Tcp(t) => t.serve_loop(sender).await,
            Connection::Tls(t) => t.serve_loop(sender).await,
            Connection::Channel(t) => t.serve_loop(sender).await,
        }
    }

    pub async fn close(&self) {
        match self {
            Connection::Udp(_) => {} // no connection state
            Connection::Tcp(t) => t.close().await,
            Connection::Tls(t) => t.close().await,
            Connection::Channel(t) => t.close().await,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Connection::Udp(t) => t.local_addr(),
            Connection::Tcp(t) => t.local_addr(),
            Connection::Tls(t) => t.local_addr(),
            Connection::Channel(t) => t.local_addr(),
        }
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Udp(t) => write!(f, "UDP {}", t),
            Connection::Tcp(t) => write!(f, "TCP {}", t),
            Connection::Tls(t) => write!(f, "TLS {}", t),
            Connection::Channel(t) => write!(f, "{}", t),
        }
    }
}

impl From<UdpConnection> for Connection {
    fn from(connection: UdpConnection) -> Self {
        Connection::Udp(connection)
    }
}

impl From<TcpConnection> for Connection {
    fn from(connection: TcpConnection) -> Self {
        Connection::Tcp(connection)
    }
}

impl From<TlsConnection> for Connection {
    fn from(connection: TlsConnection) -> Self {
        Connection::Tls(connection)
    }
}

impl From<ChannelConnection> for Connection {
    fn from(connection: ChannelConnection) -> Self {
        Connection::Channel(connection)
    }
}

/// Replace an unspecified bind address with the first non-loopback IPv4
/// interface, falling back to loopback.
pub fn resolve_bind_address(addr: SocketAddr) -> SocketAddr {
    if !addr.ip().is_unspecified() {
        return addr;
    }
    let interfaces = match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(_) => return addr,
    };
    for interface in interfaces {
        if interface.is_loopback() {
            continue;
        }
        if let get_if_addrs::IfAddr::V4(v4addr) = interface.addr {
            return SocketAddr::new(IpAddr::V4(v4addr.ip), addr.port());
        }
        // no IPv6 transport
    }
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
}
