use super::{TransportEvent, TransportReceiver, TransportSender};
use crate::message::SipMessage;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

struct ChannelInner {
    incoming: Mutex<Option<TransportReceiver>>,
    outgoing: TransportSender,
    addr: SocketAddr,
}

/// In-memory transport for tests: everything the agent sends appears on the
/// `outgoing` channel, and whatever the test pushes into `incoming` is
/// delivered as if it had arrived from the network.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

impl ChannelConnection {
    pub fn create_connection(
        incoming: TransportReceiver,
        outgoing: TransportSender,
        addr: SocketAddr,
    ) -> Self {
        ChannelConnection {
            inner: Arc::new(ChannelInner {
                incoming: Mutex::new(Some(incoming)),
                outgoing,
                addr,
            }),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub async fn send_message(&self, msg: &SipMessage) -> Result<()> {
        self.inner
            .outgoing
            .send(TransportEvent::Incoming(msg.clone(), self.inner.addr))
            .map_err(Into::into)
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let incoming = self.inner.incoming.lock().unwrap().take();
        let mut incoming = match incoming {
            Some(incoming) => incoming,
            None => return Err(Error::Transport("serve_loop called twice".to_string())),
        };
        while let Some(event) = incoming.recv().await {
            sender.send(event)?;
        }
        sender.send(TransportEvent::Closed)?;
        Ok(())
    }

    pub async fn close(&self) {}
}

impl std::fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CHANNEL {}", self.inner.addr)
    }
}
