use super::{make_branch, make_call_id, make_response, make_tag, unix_seconds, UserAgentInner};
use crate::auth::{authorization_header, Credential, DigestChallenge};
use crate::event::{CallPhase, LogLevel};
use crate::media::RtpSession;
use crate::message::{address_uri, Method, Request, Response};
use crate::sdp::{build_answer, build_offer, SessionDescription};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

/// How long a cancelled INVITE may wait for its 487 before the call slot is
/// reclaimed anyway.
const CANCEL_LINGER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Calling,
    Ringing,
    RingingIn,
    Active,
    Terminating,
}

/// One dialog. At most one exists per agent; a second INVITE is refused
/// with 486 without touching it.
pub struct Call {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    pub direction: CallDirection,
    pub state: CallState,
    /// Last CSeq this side used within the dialog.
    pub cseq: u32,
    /// CSeq of the INVITE; ACK and CANCEL reuse this number.
    pub invite_cseq: u32,
    /// Via branch of the INVITE client transaction.
    pub branch: String,
    /// From value on requests this side sends in-dialog.
    pub local_header: String,
    /// To value on requests this side sends in-dialog.
    pub remote_header: String,
    /// Request-URI for in-dialog requests (the peer's Contact when known).
    pub remote_target: String,
    pub local_sdp: String,
    pub remote_sdp: Option<SessionDescription>,
    /// Bound at `invite()` for outbound calls, at `answer()` for inbound.
    pub rtp: Option<RtpSession>,
    /// Inbound only: the INVITE exactly as received, so every response in
    /// its transaction echoes the original headers.
    pub invite: Option<Request>,
    /// Outbound only: the INVITE as sent, for ACK/CANCEL/auth rebuilds.
    pub invite_sent: Option<Request>,
    /// Where the peer's requests came from; responses return there.
    pub peer_source: Option<SocketAddr>,
    pub auth_sent: bool,
}

impl Call {
    fn is(&self, call_id: Option<&str>) -> bool {
        call_id == Some(self.call_id.as_str())
    }
}

/// `user@host` or a bare dial string -> a full SIP URI.
fn normalize_target(target: &str, server: &str) -> String {
    let trimmed = target.trim();
    let bare = trimmed.strip_prefix("sip:").unwrap_or(trimmed);
    if bare.contains('@') {
        format!("sip:{}", bare)
    } else {
        format!("sip:{}@{}", bare, server)
    }
}

/// ACK for a non-2xx final response: transaction-scoped, so it reuses the
/// INVITE's Via branch and CSeq number, taking To from the response.
fn build_failure_ack(invite: &Request, response: &Response) -> Request {
    let mut ack = Request::new(Method::Ack, invite.uri.clone());
    for via in invite.headers.get_all("via") {
        ack.headers.push("Via", via.to_string());
    }
    ack.headers.push("Max-Forwards", "70");
    if let Some(from) = invite.headers.get("from") {
        ack.headers.push("From", from.to_string());
    }
    match response.headers.get("to").or_else(|| invite.headers.get("to")) {
        Some(to) => ack.headers.push("To", to.to_string()),
        None => {}
    }
    if let Some(call_id) = invite.headers.get("call-id") {
        ack.headers.push("Call-ID", call_id.to_string());
    }
    let cseq = invite.cseq().map(|c| c.seq).unwrap_or(1);
    ack.headers.push("CSeq", format!("{} ACK", cseq));
    ack
}

impl UserAgentInner {
    pub(crate) async fn invite(&self, target: &str) -> Result<()> {
        if self.call.lock().unwrap().is_some() {
            let e = Error::Protocol("a call is already in progress".to_string());
            self.log(LogLevel::Error, e.to_string());
            return Err(e);
        }
        let link = match self.link() {
            Ok(link) => link,
            Err(e) => {
                self.log(LogLevel::Error, "cannot call: not connected".to_string());
                return Err(e);
            }
        };

        let remote_uri = normalize_target(target, &self.config.server);
        let rtp = RtpSession::bind(self.events.clone()).await.map_err(|e| {
            self.log(LogLevel::Error, format!("RTP bind failed: {}", e));
            e
        })?;
        let local_sdp = build_offer(
            link.local_ip,
            rtp.local_port(),
            &self.config.extension,
            unix_seconds(),
        );

        let call_id = make_call_id();
        let local_tag = make_tag();
        let branch = make_branch();
        let from = self.local_identity(&local_tag);
        let to = format!("<{}>", remote_uri);

        let mut request = self.base_request(
            Method::Invite,
            &remote_uri,
            &branch,
            from.clone(),
            to.clone(),
            &call_id,
            1,
        )?;
        request.headers.push("Contact", self.contact_header()?);
        request.headers.push("Content-Type", "application/sdp");
        request.body = local_sdp.clone().into_bytes();

        *self.call.lock().unwrap() = Some(Call {
            call_id,
            local_tag,
            remote_tag: None,
            direction: CallDirection::Outbound,
            state: CallState::Calling,
            cseq: 1,
            invite_cseq: 1,
            branch,
            local_header: from,
            remote_header: to,
            remote_target: remote_uri.clone(),
            local_sdp,
            remote_sdp: None,
            rtp: Some(rtp),
            invite: None,
            invite_sent: Some(request.clone()),
            peer_source: None,
            auth_sent: false,
        });

        info!("calling {}", remote_uri);
        self.call_state(CallPhase::Calling, &remote_uri);
        if let Err(e) = self.send_message(&request.into(), None).await {
            self.finish_call(&format!("Send failed: {}", e));
            return Err(e);
        }
        Ok(())
    }

    pub(crate) async fn answer(&self) -> Result<()> {
        let (invite, offer, local_tag, peer_source) = {
            let guard = self.call.lock().unwrap();
            let call = guard
                .as_ref()
                .ok_or_else(|| Error::Protocol("no call to answer".to_string()))?;
            if call.state != CallState::RingingIn {
                return Err(Error::Protocol("no ringing inbound call".to_string()));
            }
            let invite = call
                .invite
                .clone()
                .ok_or_else(|| Error::Protocol("inbound call without INVITE".to_string()))?;
            let offer = call
                .remote_sdp
                .clone()
                .ok_or_else(|| Error::Protocol("caller sent no SDP offer".to_string()))?;
            (invite, offer, call.local_tag.clone(), call.peer_source)
        };

        let media_target = offer.audio_target()?;
        let rtp = RtpSession::bind(self.events.clone()).await?;
        let link = self.link()?;
        let (sdp, pt) = build_answer(
            link.local_ip,
            rtp.local_port(),
            &self.config.extension,
            unix_seconds(),
            &offer,
        );

        let mut response = make_response(&invite, 200, "OK", Some(&local_tag));
        response.headers.push("Contact", self.contact_header()?);
        response.headers.push("Content-Type", "application/sdp");
        response.body = sdp.clone().into_bytes();

        {
            // the call may have been cancelled while the socket was binding
            let mut guard = self.call.lock().unwrap();
            let call = match guard.as_mut() {
                Some(call) if call.state == CallState::RingingIn => call,
                _ => {
                    rtp.close();
                    return Err(Error::Protocol("call went away while answering".to_string()));
                }
            };
            call.local_sdp = sdp;
            call.rtp = Some(rtp.clone());
            call.state = CallState::Active;
        }

        self.send_message(&response.into(), peer_source).await?;
        let (addr, _) = media_target;
        rtp.start(addr, pt);
        info!("call answered, media to {} pt {}", addr, pt);
        self.call_state(CallPhase::Active, "Answered");
        Ok(())
    }

    pub(crate) async fn hangup(self: Arc<Self>) -> Result<()> {
        enum Action {
            Cancel(Request),
            Reject(Response, Option<SocketAddr>),
            Bye(Request),
            Nothing,
        }

        let action = {
            let mut guard = self.call.lock().unwrap();
            let call = match guard.as_mut() {
                Some(call) => call,
                None => return Err(Error::Protocol("no call to hang up".to_string())),
            };
            match call.state {
                CallState::Calling | CallState::Ringing => {
                    let invite = call
                        .invite_sent
                        .as_ref()
                        .ok_or_else(|| Error::Protocol("outbound call without INVITE".to_string()))?;
                    let mut cancel = Request::new(Method::Cancel, invite.uri.clone());
                    // CANCEL lives in the INVITE's transaction: same Via,
                    // same CSeq number, To without the remote tag
                    for via in invite.headers.get_all("via") {
                        cancel.headers.push("Via", via.to_string());
                    }
                    cancel.headers.push("Max-Forwards", "70");
                    for name in ["from", "to", "call-id"] {
                        if let Some(value) = invite.headers.get(name) {
                            cancel.headers.push(name, value.to_string());
                        }
                    }
                    cancel
                        .headers
                        .push("CSeq", format!("{} CANCEL", call.invite_cseq));
                    call.state = CallState::Terminating;
                    Action::Cancel(cancel)
                }
                CallState::RingingIn => {
                    let invite = call
                        .invite
                        .as_ref()
                        .ok_or_else(|| Error::Protocol("inbound call without INVITE".to_string()))?;
                    let response =
                        make_response(invite, 486, "Busy Here", Some(&call.local_tag));
                    let source = call.peer_source;
                    Action::Reject(response, source)
                }
                CallState::Active => {
                    let bye = self.build_in_dialog_request(call, Method::Bye)?;
                    Action::Bye(bye)
                }
                CallState::Terminating => Action::Nothing,
            }
        };

        match action {
            Action::Cancel(cancel) => {
                self.send_message(&cancel.into(), None).await?;
                // reclaim the slot if the 487 never shows up
                let watchdog = self.clone();
                tokio::spawn(async move {
                    sleep(CANCEL_LINGER).await;
                    let lingering = {
                        let guard = watchdog.call.lock().unwrap();
                        matches!(
                            guard.as_ref(),
                            Some(call) if call.state == CallState::Terminating
                        )
                    };
                    if lingering {
                        watchdog.finish_call("Cancelled");
                    }
                });
            }
            Action::Reject(response, source) => {
                self.send_message(&response.into(), source).await?;
                self.finish_call("Rejected");
            }
            Action::Bye(bye) => {
                // best effort, one attempt
                let result = self.send_message(&bye.into(), None).await;
                self.finish_call("Hung up");
                result?;
            }
            Action::Nothing => {}
        }
        Ok(())
    }

    pub(crate) async fn send_dtmf(&self, digit: char) -> Result<()> {
        let info = {
            let mut guard = self.call.lock().unwrap();
            let call = match guard.as_mut() {
                Some(call) if call.state == CallState::Active => call,
                _ => return Err(Error::Protocol("DTMF requires an active call".to_string())),
            };
            let mut info = self.build_in_dialog_request(call, Method::Info)?;
            info.headers
                .push("Content-Type", "application/dtmf-relay");
            info.body = format!("Signal={}\r\nDuration=160\r\n", digit).into_bytes();
            info
        };
        self.log(LogLevel::Call, format!("DTMF {}", digit));
        self.send_message(&info.into(), None).await
    }

    /// A request within the established dialog: fresh branch, next CSeq,
    /// routed at the peer's contact.
    fn build_in_dialog_request(&self, call: &mut Call, method: Method) -> Result<Request> {
        call.cseq += 1;
        self.base_request(
            method,
            &call.remote_target.clone(),
            &make_branch(),
            call.local_header.clone(),
            call.remote_header.clone(),
            &call.call_id.clone(),
            call.cseq,
        )
    }

    /// Drop the call slot, stop media, tell the shell.
    pub(crate) fn finish_call(&self, reason: &str) {
        let call = self.call.lock().unwrap().take();
        if let Some(call) = call {
            if let Some(rtp) = call.rtp {
                rtp.close();
            }
            info!("call finished: {}", reason);
            self.call_state(CallPhase::Idle, reason);
        }
    }

    pub(crate) async fn handle_call_response(
        &self,
        response: Response,
        method: Method,
    ) -> Result<()> {
        match method {
            Method::Invite => self.handle_invite_response(response).await,
            // BYE/CANCEL/INFO answers carry no state; the dialog moved on
            // when the request went out
            _ => {
                debug!("{} answered with {}", method.as_str(), response.status);
                Ok(())
            }
        }
    }

    async fn handle_invite_response(&self, response: Response) -> Result<()> {
        enum Action {
            Nothing,
            Ringing,
            AuthRetry(Request, Request),
            Accepted(Request, RtpSession, SocketAddr, u8),
            AcceptedUnusable(Request, String),
            Failed(Request, String),
        }

        let action = {
            let mut guard = self.call.lock().unwrap();
            let call = match guard.as_mut() {
                Some(call)
                    if call.direction == CallDirection::Outbound
                        && call.is(response.call_id()) =>
                {
                    call
                }
                _ => {
                    debug!("INVITE response for no current call");
                    return Ok(());
                }
            };

            match response.status {
                100 => Action::Nothing,
                101..=199 => {
                    if let Some(tag) = response.to_tag() {
                        call.remote_tag = Some(tag.to_string());
                        if let Some(to) = response.headers.get("to") {
                            call.remote_header = to.to_string();
                        }
                    }
                    if call.state == CallState::Calling {
                        call.state = CallState::Ringing;
                        Action::Ringing
                    } else {
                        Action::Nothing
                    }
                }
                401 | 407 if !call.auth_sent => {
                    let invite = match call.invite_sent.clone() {
                        Some(invite) => invite,
                        None => return Ok(()),
                    };
                    let ack = build_failure_ack(&invite, &response);
                    let header = response
                        .headers
                        .get("www-authenticate")
                        .or_else(|| response.headers.get("proxy-authenticate"));
                    match header.map(DigestChallenge::parse) {
                        Some(Ok(challenge)) => {
                            let credential = Credential {
                                username: self.config.extension.clone(),
                                password: self.config.password.clone(),
                            };
                            let authorization = authorization_header(
                                &credential,
                                &challenge,
                                Method::Invite.as_str(),
                                &invite.uri,
                            );

                            // same dialog identity, fresh transaction: new
                            // branch, CSeq one higher, credentials attached
                            let branch = make_branch();
                            let cseq = call.invite_cseq + 1;
                            let mut retry = invite.clone();
                            if let Some(via) = invite.headers.get("via") {
                                let via = via.replacen(&call.branch, &branch, 1);
                                retry.headers.set("Via", via);
                            }
                            retry.headers.set("CSeq", format!("{} INVITE", cseq));
                            retry.headers.remove("authorization");
                            retry.headers.push("Authorization", authorization);

                            call.branch = branch;
                            call.cseq = cseq;
                            call.invite_cseq = cseq;
                            call.auth_sent = true;
                            call.invite_sent = Some(retry.clone());
                            Action::AuthRetry(ack, retry)
                        }
                        _ => Action::Failed(
                            ack,
                            format!("{} without Digest challenge", response.status),
                        ),
                    }
                }
                200..=299 => {
                    if let Some(tag) = response.to_tag() {
                        call.remote_tag = Some(tag.to_string());
                    }
                    if let Some(to) = response.headers.get("to") {
                        call.remote_header = to.to_string();
                    }
                    if let Some(contact) = response.headers.get("contact") {
                        call.remote_target = address_uri(contact).to_string();
                    }

                    let to = response
                        .headers
                        .get("to")
                        .unwrap_or(&call.remote_header)
                        .to_string();
                    let mut ack = self.base_request(
                        Method::Ack,
                        &call.remote_target.clone(),
                        &make_branch(),
                        call.local_header.clone(),
                        to,
                        &call.call_id.clone(),
                        call.invite_cseq,
                    )?;
                    ack.headers.push("Contact", self.contact_header()?);

                    let body = String::from_utf8_lossy(&response.body).to_string();
                    match SessionDescription::parse(&body)
                        .and_then(|sdp| sdp.audio_target().map(|t| (sdp, t)))
                    {
                        Ok((sdp, (addr, pt))) => {
                            call.remote_sdp = Some(sdp);
                            call.state = CallState::Active;
                            let rtp = call
                                .rtp
                                .clone()
                                .ok_or_else(|| Error::Media("call without RTP".to_string()))?;
                            Action::Accepted(ack, rtp, addr, pt)
                        }
                        Err(e) => Action::AcceptedUnusable(ack, format!("unusable answer SDP: {}", e)),
                    }
                }
                status => {
                    let invite = match call.invite_sent.as_ref() {
                        Some(invite) => invite,
                        None => return Ok(()),
                    };
                    let ack = build_failure_ack(invite, &response);
                    Action::Failed(ack, format!("{} {}", status, response.reason))
                }
            }
        };

        match action {
            Action::Nothing => Ok(()),
            Action::Ringing => {
                self.call_state(CallPhase::Ringing, "Ringing");
                Ok(())
            }
            Action::AuthRetry(ack, retry) => {
                self.send_message(&ack.into(), None).await?;
                self.send_message(&retry.into(), None).await
            }
            Action::Accepted(ack, rtp, addr, pt) => {
                self.send_message(&ack.into(), None).await?;
                rtp.start(addr, pt);
                info!("call established, media to {} pt {}", addr, pt);
                self.call_state(CallPhase::Active, "Connected");
                Ok(())
            }
            Action::AcceptedUnusable(ack, reason) => {
                self.send_message(&ack.into(), None).await?;
                self.log(LogLevel::Error, reason.clone());
                self.finish_call(&reason);
                Ok(())
            }
            Action::Failed(ack, reason) => {
                self.send_message(&ack.into(), None).await?;
                self.finish_call(&reason);
                Ok(())
            }
        }
    }

    pub(crate) async fn handle_request(
        &self,
        request: Request,
        source: SocketAddr,
    ) -> Result<()> {
        match request.method.clone() {
            Method::Invite => self.on_invite(request, source).await,
            Method::Cancel => self.on_cancel(request, source).await,
            Method::Ack => Ok(()),
            Method::Bye => self.on_bye(request, source).await,
            Method::Options => {
                // keepalive probe: 200 with a fresh To tag and capabilities
                let mut response = make_response(&request, 200, "OK", Some(&make_tag()));
                response
                    .headers
                    .push("Allow", crate::message::ALLOWED_METHODS);
                self.send_message(&response.into(), Some(source)).await
            }
            Method::Notify => {
                let mut response = make_response(&request, 200, "OK", None);
                response
                    .headers
                    .push("Allow", crate::message::ALLOWED_METHODS);
                self.send_message(&response.into(), Some(source)).await
            }
            Method::Info => {
                let in_call = {
                    let guard = self.call.lock().unwrap();
                    guard.as_ref().map_or(false, |call| call.is(request.call_id()))
                };
                let response = if in_call {
                    make_response(&request, 200, "OK", None)
                } else {
                    make_response(&request, 481, "Call/Transaction Does Not Exist", None)
                };
                self.send_message(&response.into(), Some(source)).await
            }
            Method::Register | Method::Other(_) => {
                let response = make_response(&request, 501, "Not Implemented", None);
                self.send_message(&response.into(), Some(source)).await
            }
        }
    }

    async fn on_invite(&self, request: Request, source: SocketAddr) -> Result<()> {
        if request.call_id().is_none() || request.cseq().is_none() {
            let response = make_response(&request, 400, "Bad Request", None);
            return self.send_message(&response.into(), Some(source)).await;
        }

        let busy = self.call.lock().unwrap().is_some();
        if busy {
            // never disturb the existing call
            let response = make_response(&request, 486, "Busy Here", Some(&make_tag()));
            return self.send_message(&response.into(), Some(source)).await;
        }

        let local_tag = make_tag();
        let caller = request
            .headers
            .get("from")
            .unwrap_or("unknown caller")
            .to_string();
        let offer = if request.body.is_empty() {
            None
        } else {
            SessionDescription::parse(&String::from_utf8_lossy(&request.body)).ok()
        };

        let trying = make_response(&request, 100, "Trying", None);
        let mut ringing = make_response(&request, 180, "Ringing", Some(&local_tag));
        ringing.headers.push("Contact", self.contact_header()?);

        let remote_header = caller.clone();
        let local_header = crate::message::with_tag(
            request.headers.get("to").unwrap_or(""),
            &local_tag,
        );
        let remote_target = request
            .headers
            .get("contact")
            .map(|c| address_uri(c).to_string())
            .unwrap_or_else(|| address_uri(&caller).to_string());

        *self.call.lock().unwrap() = Some(Call {
            call_id: request.call_id().unwrap_or_default().to_string(),
            local_tag,
            remote_tag: request.from_tag().map(|t| t.to_string()),
            direction: CallDirection::Inbound,
            state: CallState::RingingIn,
            cseq: 0,
            invite_cseq: request.cseq().map(|c| c.seq).unwrap_or(1),
            branch: request.via_branch().unwrap_or_default().to_string(),
            local_header,
            remote_header,
            remote_target,
            local_sdp: String::new(),
            remote_sdp: offer,
            rtp: None,
            invite: Some(request),
            invite_sent: None,
            peer_source: Some(source),
            auth_sent: false,
        });

        info!("incoming call from {}", caller);
        self.send_message(&trying.into(), Some(source)).await?;
        self.send_message(&ringing.into(), Some(source)).await?;
        self.call_state(CallPhase::RingingIn, &caller);
        Ok(())
    }

    async fn on_cancel(&self, request: Request, source: SocketAddr) -> Result<()> {
        let invite = {
            let guard = self.call.lock().unwrap();
            match guard.as_ref() {
                Some(call)
                    if call.state == CallState::RingingIn
                        && request.via_branch().is_some()
                        && request.via_branch().map(|b| b.to_string())
                            == call
                                .invite
                                .as_ref()
                                .and_then(|i| i.via_branch())
                                .map(|b| b.to_string()) =>
                {
                    call.invite.clone().map(|invite| (invite, call.local_tag.clone()))
                }
                _ => None,
            }
        };

        let Some((invite, local_tag)) = invite else {
            let response =
                make_response(&request, 481, "Call/Transaction Does Not Exist", None);
            return self.send_message(&response.into(), Some(source)).await;
        };

        // the CANCEL succeeds, then its INVITE dies with 487
        let ok = make_response(&request, 200, "OK", None);
        self.send_message(&ok.into(), Some(source)).await?;
        let terminated =
            make_response(&invite, 487, "Request Terminated", Some(&local_tag));
        self.send_message(&terminated.into(), Some(source)).await?;
        self.finish_call("Cancelled");
        Ok(())
    }

    async fn on_bye(&self, request: Request, source: SocketAddr) -> Result<()> {
        let known = {
            let guard = self.call.lock().unwrap();
            guard.as_ref().map_or(false, |call| call.is(request.call_id()))
        };
        if !known {
            let response = make_response(&request, 481, "Call/Transaction Does Not Exist", None);
            return self.send_message(&response.into(), Some(source)).await;
        }
        let response = make_response(&request, 200, "OK", None);
        self.send_message(&response.into(), Some(source)).await?;
        self.finish_call("Remote hung up");
        Ok(())
    }
}
