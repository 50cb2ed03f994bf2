use super::{TransportEvent, TransportSender};
use crate::message::{parse::find_header_end, parse_message, SipMessage};
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::Decoder;
use tracing::{debug, error, warn};

const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// Frames SIP messages out of a byte stream.
///
/// A message ends `Content-Length` bytes after the blank line; a missing
/// header means an empty body. Stray CRLF between messages (keepalives) is
/// discarded. The framer consumes exactly one message per `Ok(Some(..))`,
/// leaving any following bytes in the buffer.
pub struct SipFramer {
    max_size: usize,
}

impl SipFramer {
    pub fn new() -> Self {
        Self {
            max_size: MAX_SIP_MESSAGE_SIZE,
        }
    }
}

impl Default for SipFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SipFramer {
    type Item = SipMessage;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SipMessage>> {
        // a message never starts with CRLF, so leading CRLFs are keepalives
        while src.len() >= 2 && &src[0..2] == b"\r\n" {
            src.advance(2);
        }
        if src.is_empty() {
            return Ok(None);
        }

        let header_end = match find_header_end(src) {
            Some(pos) => pos,
            None => {
                if src.len() > self.max_size {
                    return Err(Error::Parse("SIP message too large".to_string()));
                }
                return Ok(None);
            }
        };

        let content_length = content_length_of(&src[..header_end]);
        let total = header_end + 4 + content_length;
        if total > self.max_size {
            return Err(Error::Parse("SIP message too large".to_string()));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        // the frame is consumed either way, keeping the stream aligned
        parse_message(&frame).map(Some)
    }
}

/// `Content-Length` value found in the raw header region, default 0.
fn content_length_of(head: &[u8]) -> usize {
    let head = String::from_utf8_lossy(head);
    for line in head.lines().skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

/// Common contract of the connected stream transports.
#[async_trait::async_trait]
pub trait StreamConnection: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;

    async fn send_message(&self, msg: &SipMessage) -> Result<()>;

    async fn serve_loop(&self, sender: TransportSender) -> Result<()>;

    async fn close(&self);
}

/// Shared read/write state behind [`TcpConnection`](super::TcpConnection)
/// and [`TlsConnection`](super::TlsConnection).
pub struct StreamInner<R, W> {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    read_half: Mutex<Option<R>>,
    write_half: Mutex<Option<W>>,
}

impl<R, W> StreamInner<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr, read: R, write: W) -> Self {
        Self {
            local_addr,
            remote_addr,
            read_half: Mutex::new(Some(read)),
            write_half: Mutex::new(Some(write)),
        }
    }

    pub async fn send_message(&self, msg: &SipMessage) -> Result<()> {
        self.send_raw(&msg.to_bytes()).await
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.write_half.lock().await;
        match guard.as_mut() {
            Some(write_half) => {
                write_half.write_all(data).await?;
                write_half.flush().await?;
                Ok(())
            }
            None => Err(Error::Transport("stream already closed".to_string())),
        }
    }

    /// Read until EOF or error, delivering framed messages upward. Emits
    /// [`TransportEvent::Closed`] exactly once when the stream dies.
    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let read_half = self.read_half.lock().await.take();
        let mut read_half = match read_half {
            Some(read_half) => read_half,
            None => return Err(Error::Transport("serve_loop called twice".to_string())),
        };

        let mut framer = SipFramer::new();
        let mut buffer = BytesMut::with_capacity(4096);
        let mut read_buf = [0u8; 4096];

        loop {
            match read_half.read(&mut read_buf).await {
                Ok(0) => {
                    debug!("stream closed by peer: {}", self.remote_addr);
                    break;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&read_buf[..n]);
                    loop {
                        match framer.decode(&mut buffer) {
                            Ok(Some(msg)) => {
                                sender.send(TransportEvent::Incoming(msg, self.remote_addr))?;
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("undecodable frame from {}: {}", self.remote_addr, e);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("error reading stream from {}: {}", self.remote_addr, e);
                    break;
                }
            }
        }

        sender.send(TransportEvent::Closed)?;
        Ok(())
    }

    pub async fn close(&self) {
        let mut guard = self.write_half.lock().await;
        if let Some(write_half) = guard.as_mut() {
            write_half.shutdown().await.ok();
        }
        *guard = None;
    }
}
