pub mod call;
pub mod registration;

pub use call::{Call, CallDirection, CallState};
pub use registration::Registration;

use crate::config::PhoneConfig;
use crate::event::{CallPhase, Event, EventSender, LinkState, LogLevel};
use crate::message::{Method, Request, Response, SipMessage, ALLOWED_METHODS};
use crate::transport::{
    resolve_bind_address, Connection, TcpConnection, TlsConnection, TransportEvent,
    TransportReceiver, UdpConnection,
};
use crate::{Error, Result, TransportKind};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const TAG_LEN: usize = 8;
pub const CALL_ID_LEN: usize = 22;
pub const BRANCH_MAGIC: &str = "z9hG4bK";
pub const USER_AGENT_NAME: &str = concat!("softsip/", env!("CARGO_PKG_VERSION"));

pub fn random_text(count: usize) -> String {
    use rand::Rng;
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(count)
        .map(char::from)
        .collect::<String>()
}

/// A Via branch: the RFC 3261 magic cookie plus 16 hex characters.
pub fn make_branch() -> String {
    format!("{}{:016x}", BRANCH_MAGIC, rand::random::<u64>())
}

pub fn make_tag() -> String {
    random_text(TAG_LEN)
}

pub fn make_call_id() -> String {
    random_text(CALL_ID_LEN)
}

pub(crate) fn unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The established signaling path: one connection toward one server.
#[derive(Clone)]
pub(crate) struct Link {
    pub connection: Connection,
    pub server_addr: SocketAddr,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub token: CancellationToken,
}

pub(crate) struct UserAgentInner {
    pub(crate) config: PhoneConfig,
    pub(crate) events: EventSender,
    pub(crate) cancel_token: CancellationToken,
    pub(crate) link: Mutex<Option<Link>>,
    pub(crate) registration: Mutex<Option<Registration>>,
    pub(crate) call: Mutex<Option<Call>>,
    /// Routes REGISTER responses to the registration task.
    pub(crate) register_responses: Mutex<Option<UnboundedSender<Response>>>,
}

/// The softphone core. One registrar, at most one call.
///
/// All protocol state is mutated from the dispatch task and the public
/// methods, each of which holds the relevant lock only while it computes;
/// sends happen after the lock is dropped.
#[derive(Clone)]
pub struct UserAgent {
    inner: Arc<UserAgentInner>,
}

impl UserAgent {
    pub fn new(config: PhoneConfig, events: EventSender) -> UserAgent {
        UserAgent {
            inner: Arc::new(UserAgentInner {
                config,
                events,
                cancel_token: CancellationToken::new(),
                link: Mutex::new(None),
                registration: Mutex::new(None),
                call: Mutex::new(None),
                register_responses: Mutex::new(None),
            }),
        }
    }

    /// Open the transport and start the REGISTER lifecycle. On transport
    /// loss the agent goes `Disconnected` and stays there until the caller
    /// invokes this again.
    pub async fn register(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.config.server.is_empty() || inner.config.extension.is_empty() {
            let reason = "server and extension must be configured".to_string();
            inner.status(LinkState::Disconnected, &reason);
            return Err(Error::Protocol(reason));
        }

        inner.teardown_link().await;
        inner.status(
            LinkState::Connecting,
            &format!("Connecting to {}", inner.config.server),
        );

        if let Err(e) = inner.clone().open_link().await {
            inner.log(LogLevel::Error, format!("connect failed: {}", e));
            inner.status(LinkState::Disconnected, &e.to_string());
            return Err(e);
        }

        let link_token = match inner.link.lock().unwrap().as_ref() {
            Some(link) => link.token.clone(),
            None => return Err(Error::Transport("link vanished".to_string())),
        };
        let reg_token = link_token.child_token();
        *inner.registration.lock().unwrap() = Some(Registration::new(reg_token.clone()));
        let task_inner = inner.clone();
        tokio::spawn(async move { task_inner.registration_loop(reg_token).await });
        Ok(())
    }

    /// Send a final `Expires: 0` REGISTER and tear the transport down two
    /// seconds later, whatever the server says.
    pub async fn unregister(&self) -> Result<()> {
        self.inner.clone().unregister().await
    }

    /// Place a call. `target` is `user@host` or a bare dial string, which is
    /// completed with the configured server.
    pub async fn invite(&self, target: &str) -> Result<()> {
        self.inner.clone().invite(target).await
    }

    /// Accept the ringing inbound call.
    pub async fn answer(&self) -> Result<()> {
        self.inner.clone().answer().await
    }

    /// End the current call, whatever its phase: CANCEL while calling,
    /// 486 while ringing inbound, BYE while active.
    pub async fn hangup(&self) -> Result<()> {
        self.inner.clone().hangup().await
    }

    /// Flip the microphone mute. Returns the new muted state.
    pub fn toggle_mute(&self) -> bool {
        let call = self.inner.call.lock().unwrap();
        match call.as_ref().and_then(|call| call.rtp.as_ref()) {
            Some(rtp) => {
                let muted = !rtp.is_muted();
                rtp.set_muted(muted);
                muted
            }
            None => false,
        }
    }

    /// Send one DTMF digit as SIP INFO (`application/dtmf-relay`).
    pub async fn send_dtmf(&self, digit: char) -> Result<()> {
        self.inner.clone().send_dtmf(digit).await
    }

    /// Queue one block of 16-bit LE PCM microphone audio; 20 ms frames
    /// (320 bytes) are preferred, other sizes go out as one block per tick.
    pub fn feed_mic_audio(&self, pcm: &[u8]) {
        let call = self.inner.call.lock().unwrap();
        if let Some(call) = call.as_ref() {
            if call.state == CallState::Active {
                if let Some(rtp) = call.rtp.as_ref() {
                    rtp.feed_mic(pcm);
                }
            }
        }
    }

    /// Stop everything: timers, transport, any live call. Idempotent; no
    /// events are delivered after this returns.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.cancel_token.is_cancelled() {
            return;
        }
        let call = inner.call.lock().unwrap().take();
        if let Some(call) = call {
            if let Some(rtp) = call.rtp {
                rtp.close();
            }
            inner.call_state(CallPhase::Idle, "Stopped");
        }
        inner.status(LinkState::Disconnected, "Stopped");
        inner.cancel_token.cancel();
        inner.teardown_link().await;
        info!("user agent stopped");
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<UserAgentInner> {
        &self.inner
    }
}

impl UserAgentInner {
    pub(crate) fn emit(&self, event: Event) {
        if !self.cancel_token.is_cancelled() {
            self.events.send(event).ok();
        }
    }

    pub(crate) fn log(&self, level: LogLevel, text: String) {
        match level {
            LogLevel::Error => warn!("{}", text),
            LogLevel::Warn => warn!("{}", text),
            _ => debug!("{}", text),
        }
        self.emit(Event::Log(level, text));
    }

    pub(crate) fn status(&self, state: LinkState, text: &str) {
        self.emit(Event::Status(state, text.to_string()));
    }

    pub(crate) fn call_state(&self, phase: CallPhase, text: &str) {
        self.emit(Event::CallState(phase, text.to_string()));
    }

    pub(crate) fn link(&self) -> Result<Link> {
        self.link
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Transport("not connected".to_string()))
    }

    /// Resolve, connect, and start the serve/dispatch tasks.
    async fn open_link(self: Arc<Self>) -> Result<()> {
        let port = self.config.effective_port();
        let server_addr = resolve_server(&self.config.server, port).await?;
        let local_ip = local_ip_toward(server_addr).await;

        let connection: Connection = match self.config.transport {
            TransportKind::Udp => UdpConnection::create_connection("0.0.0.0:0".parse()?)
                .await?
                .into(),
            TransportKind::Tcp => TcpConnection::connect(server_addr).await?.into(),
            TransportKind::Tls => TlsConnection::connect(&self.config.server, server_addr)
                .await?
                .into(),
        };
        let local_port = connection.local_addr().port();
        let token = self.cancel_token.child_token();

        let link = Link {
            connection: connection.clone(),
            server_addr,
            local_ip,
            local_port,
            token: token.clone(),
        };
        *self.link.lock().unwrap() = Some(link);
        info!(
            "signaling link up: {} {}:{} -> {}",
            self.config.transport, local_ip, local_port, server_addr
        );

        let (sender, receiver) = unbounded_channel();
        let serve_token = token.clone();
        tokio::spawn(async move {
            select! {
                _ = serve_token.cancelled() => {}
                result = connection.serve_loop(sender) => {
                    if let Err(e) = result {
                        debug!("serve loop ended: {}", e);
                    }
                }
            }
        });
        let dispatch_inner = self.clone();
        tokio::spawn(async move { dispatch_inner.dispatch_loop(receiver, token).await });
        Ok(())
    }

    pub(crate) async fn teardown_link(&self) {
        let link = self.link.lock().unwrap().take();
        self.registration.lock().unwrap().take();
        self.register_responses.lock().unwrap().take();
        if let Some(link) = link {
            link.token.cancel();
            link.connection.close().await;
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut receiver: TransportReceiver, token: CancellationToken) {
        loop {
            select! {
                _ = token.cancelled() => return,
                event = receiver.recv() => match event {
                    None => return,
                    Some(TransportEvent::Incoming(msg, source)) => {
                        self.log(LogLevel::Sip, format!("<< {}", summarize(&msg)));
                        if let Err(e) = self.handle_message(msg, source).await {
                            self.log(LogLevel::Warn, format!("dropping message: {}", e));
                        }
                    }
                    Some(TransportEvent::Closed) => {
                        self.on_transport_closed();
                        return;
                    }
                },
            }
        }
    }

    /// Stream transports die without recourse; the caller must register
    /// again to come back.
    fn on_transport_closed(&self) {
        warn!("signaling transport closed");
        let call = self.call.lock().unwrap().take();
        if let Some(call) = call {
            if let Some(rtp) = call.rtp {
                rtp.close();
            }
            self.call_state(CallPhase::Idle, "Transport lost");
        }
        self.link.lock().unwrap().take();
        self.registration.lock().unwrap().take();
        self.register_responses.lock().unwrap().take();
        self.status(LinkState::Disconnected, "Transport closed");
    }

    async fn handle_message(&self, msg: SipMessage, source: SocketAddr) -> Result<()> {
        match msg {
            SipMessage::Request(request) => self.handle_request(request, source).await,
            SipMessage::Response(response) => {
                let cseq = response
                    .cseq()
                    .ok_or_else(|| Error::Protocol("response without CSeq".to_string()))?;
                match cseq.method {
                    Method::Register => {
                        let sender = self.register_responses.lock().unwrap().clone();
                        match sender {
                            Some(sender) => sender.send(response).map_err(Into::into),
                            None => Err(Error::Protocol(
                                "REGISTER response with no registration pending".to_string(),
                            )),
                        }
                    }
                    Method::Invite | Method::Cancel | Method::Bye | Method::Info => {
                        self.handle_call_response(response, cseq.method).await
                    }
                    other => {
                        debug!("ignoring {} response", other.as_str());
                        Ok(())
                    }
                }
            }
        }
    }

    /// Send toward the server (requests) or back to `destination`
    /// (responses to a specific source). Stream transports ignore the
    /// destination, being connected already.
    pub(crate) async fn send_message(
        &self,
        msg: &SipMessage,
        destination: Option<SocketAddr>,
    ) -> Result<()> {
        let link = self.link()?;
        let target = destination.unwrap_or(link.server_addr);
        self.log(LogLevel::Sip, format!(">> {}", summarize(msg)));
        link.connection.send(msg, Some(target)).await
    }

    /// Start line of an outgoing request with the common header block:
    /// Via (fresh or supplied branch), Max-Forwards, From/To, Call-ID,
    /// CSeq, User-Agent and Allow.
    pub(crate) fn base_request(
        &self,
        method: Method,
        uri: &str,
        branch: &str,
        from: String,
        to: String,
        call_id: &str,
        cseq: u32,
    ) -> Result<Request> {
        let link = self.link()?;
        let mut request = Request::new(method.clone(), uri);
        request.headers.push(
            "Via",
            format!(
                "SIP/2.0/{} {}:{};branch={};rport",
                self.config.transport.via_token(),
                link.local_ip,
                link.local_port,
                branch
            ),
        );
        request.headers.push("Max-Forwards", "70");
        request.headers.push("From", from);
        request.headers.push("To", to);
        request.headers.push("Call-ID", call_id.to_string());
        request
            .headers
            .push("CSeq", format!("{} {}", cseq, method.as_str()));
        request.headers.push("User-Agent", USER_AGENT_NAME);
        request.headers.push("Allow", ALLOWED_METHODS);
        Ok(request)
    }

    /// The local identity header: `"Display" <sip:ext@server>;tag=<tag>`.
    pub(crate) fn local_identity(&self, tag: &str) -> String {
        let aor = self.config.aor();
        match self.config.display_name.as_deref() {
            Some(display) if !display.is_empty() => {
                format!("\"{}\" <{}>;tag={}", display, aor, tag)
            }
            _ => format!("<{}>;tag={}", aor, tag),
        }
    }

    /// Where this agent can be reached directly.
    pub(crate) fn contact_header(&self) -> Result<String> {
        let link = self.link()?;
        Ok(format!(
            "<sip:{}@{}:{};transport={}>",
            self.config.extension,
            link.local_ip,
            link.local_port,
            self.config.transport.uri_param()
        ))
    }
}

/// A response to `request` echoing Via (all of them, in order), From, To,
/// Call-ID and CSeq verbatim. `to_tag` is appended to To when it carries no
/// tag yet; 100 Trying never gets one.
pub(crate) fn make_response(
    request: &Request,
    status: u16,
    reason: &str,
    to_tag: Option<&str>,
) -> Response {
    let mut response = Response::new(status, reason);
    for via in request.headers.get_all("via") {
        response.headers.push("Via", via.to_string());
    }
    if let Some(from) = request.headers.get("from") {
        response.headers.push("From", from.to_string());
    }
    if let Some(to) = request.headers.get("to") {
        let to = match to_tag {
            Some(tag) if status != 100 => crate::message::with_tag(to, tag),
            _ => to.to_string(),
        };
        response.headers.push("To", to);
    }
    if let Some(call_id) = request.headers.get("call-id") {
        response.headers.push("Call-ID", call_id.to_string());
    }
    if let Some(cseq) = request.headers.get("cseq") {
        response.headers.push("CSeq", cseq.to_string());
    }
    response
}

fn summarize(msg: &SipMessage) -> String {
    match msg {
        SipMessage::Request(r) => format!("{} {}", r.method, r.uri),
        SipMessage::Response(r) => {
            let about = r
                .cseq()
                .map(|c| format!(" ({})", c))
                .unwrap_or_default();
            format!("{} {}{}", r.status, r.reason, about)
        }
    }
}

/// Single A-record resolution: the first IPv4 address for `server`.
pub(crate) async fn resolve_server(server: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let addrs = tokio::net::lookup_host((server, port))
        .await
        .map_err(|e| Error::DnsResolution(format!("{}: {}", server, e)))?;
    addrs
        .into_iter()
        .find(|a| a.is_ipv4())
        .ok_or_else(|| Error::DnsResolution(format!("no IPv4 address for {}", server)))
}

/// The local IP the OS would route toward `server`: a connected UDP socket
/// reveals it without sending a packet.
pub(crate) async fn local_ip_toward(server: SocketAddr) -> IpAddr {
    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await {
        if socket.connect(server).await.is_ok() {
            if let Ok(addr) = socket.local_addr() {
                if !addr.ip().is_unspecified() {
                    return addr.ip();
                }
            }
        }
    }
    resolve_bind_address("0.0.0.0:0".parse().expect("literal addr")).ip()
}

#[cfg(test)]
mod tests;
