use super::{
    stream::{StreamConnection, StreamInner},
    TransportSender, CONNECT_TIMEOUT,
};
use crate::message::SipMessage;
use crate::{Error, Result};
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::net::TcpStream;
use tracing::info;

type TcpInner = StreamInner<tokio::io::ReadHalf<TcpStream>, tokio::io::WriteHalf<TcpStream>>;

#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<TcpInner>,
}

impl TcpConnection {
    pub async fn connect(remote: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(remote))
            .await
            .map_err(|_| Error::Timeout(format!("TCP connect to {} timed out", remote)))??;
        let local_addr = stream.local_addr()?;
        let (read_half, write_half) = tokio::io::split(stream);

        let connection = TcpConnection {
            inner: Arc::new(StreamInner::new(local_addr, remote, read_half, write_half)),
        };
        info!("created TCP connection: {} -> {}", local_addr, remote);
        Ok(connection)
    }
}

#[async_trait::async_trait]
impl StreamConnection for TcpConnection {
    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    async fn send_message(&self, msg: &SipMessage) -> Result<()> {
        self.inner.send_message(msg).await
    }

    async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        self.inner.serve_loop(sender).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

impl fmt::Display for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.inner.local_addr, self.inner.remote_addr)
    }
}
