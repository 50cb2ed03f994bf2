use super::{make_branch, make_call_id, make_tag, UserAgentInner};
use crate::auth::{authorization_header, Credential, DigestChallenge};
use crate::event::{LinkState, LogLevel};
use crate::message::{param_value, Method, Request, SipMessage};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const DEFAULT_EXPIRES: u32 = 300;
pub const REGISTER_RETRY: Duration = Duration::from_secs(5);
pub const REGISTER_ATTEMPTS: u32 = 3;
pub const UNREGISTER_LINGER: Duration = Duration::from_secs(2);

/// Refresh at 5/6 of what the server granted, never more often than once a
/// minute. 300 s granted gives the classic 250 s cadence.
pub fn refresh_interval(granted: u32) -> Duration {
    Duration::from_secs(((granted as u64) * 5 / 6).max(60))
}

/// One registration with the configured registrar. Call-ID and the local
/// tag are fixed for its whole life; CSeq strictly increases across every
/// REGISTER sent, whether initial, challenged resend, or refresh.
pub struct Registration {
    pub call_id: String,
    pub local_tag: String,
    pub cseq: u32,
    pub expires: u32,
    pub challenge: Option<DigestChallenge>,
    pub(crate) token: CancellationToken,
}

impl Registration {
    pub(crate) fn new(token: CancellationToken) -> Registration {
        Registration {
            call_id: make_call_id(),
            local_tag: make_tag(),
            cseq: 0,
            expires: DEFAULT_EXPIRES,
            challenge: None,
            token,
        }
    }
}

impl UserAgentInner {
    /// Claim the next CSeq together with the registration's fixed identity.
    fn next_register_identity(&self) -> Result<(u32, String, String)> {
        let mut registration = self.registration.lock().unwrap();
        let registration = registration
            .as_mut()
            .ok_or_else(|| Error::Protocol("not registering".to_string()))?;
        registration.cseq += 1;
        Ok((
            registration.cseq,
            registration.call_id.clone(),
            registration.local_tag.clone(),
        ))
    }

    fn build_register(&self, expires: u32, authorization: Option<&str>) -> Result<Request> {
        let (cseq, call_id, tag) = self.next_register_identity()?;
        let uri = format!("sip:{}", self.config.server);
        let from = self.local_identity(&tag);
        let to = format!("<{}>", self.config.aor());
        let mut request =
            self.base_request(Method::Register, &uri, &make_branch(), from, to, &call_id, cseq)?;
        request.headers.push("Contact", self.contact_header()?);
        request.headers.push("Expires", expires.to_string());
        if let Some(authorization) = authorization {
            request.headers.push("Authorization", authorization.to_string());
        }
        Ok(request)
    }

    /// The REGISTER lifecycle: send, retry on silence, answer one challenge
    /// per cycle, then refresh on the granted cadence until cancelled.
    pub(crate) async fn registration_loop(self: Arc<Self>, token: CancellationToken) {
        let (sender, mut responses) = unbounded_channel();
        *self.register_responses.lock().unwrap() = Some(sender);

        let credential = Credential {
            username: self.config.extension.clone(),
            password: self.config.password.clone(),
        };
        let register_uri = format!("sip:{}", self.config.server);
        let mut authorization: Option<String> = None;
        let mut auth_sent = false;

        'cycle: loop {
            let request = match self.build_register(DEFAULT_EXPIRES, authorization.as_deref()) {
                Ok(request) => request,
                Err(_) => return,
            };
            let msg = SipMessage::from(request);

            let mut attempts = 0;
            let response = 'attempt: loop {
                if attempts >= REGISTER_ATTEMPTS {
                    self.log(LogLevel::Error, "no response to REGISTER".to_string());
                    self.status(LinkState::Disconnected, "No response from server");
                    self.teardown_link().await;
                    return;
                }
                attempts += 1;
                if let Err(e) = self.send_message(&msg, None).await {
                    self.log(LogLevel::Error, format!("REGISTER send failed: {}", e));
                    self.status(LinkState::Disconnected, "Transport failure");
                    self.teardown_link().await;
                    return;
                }

                let deadline = Instant::now() + REGISTER_RETRY;
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        continue 'attempt;
                    }
                    select! {
                        _ = token.cancelled() => return,
                        received = timeout(remaining, responses.recv()) => match received {
                            Err(_) => continue 'attempt,
                            Ok(None) => return,
                            // provisional: keep waiting inside the window
                            Ok(Some(response)) if response.status < 200 => continue,
                            Ok(Some(response)) => break 'attempt response,
                        },
                    }
                }
            };

            match response.status {
                401 | 407 => {
                    if auth_sent {
                        self.log(
                            LogLevel::Error,
                            format!("registrar rejected credentials ({})", response.status),
                        );
                        self.status(LinkState::Disconnected, "Authentication failed");
                        self.teardown_link().await;
                        return;
                    }
                    let header = response
                        .headers
                        .get("www-authenticate")
                        .or_else(|| response.headers.get("proxy-authenticate"));
                    let challenge = match header.map(DigestChallenge::parse) {
                        Some(Ok(challenge)) => challenge,
                        _ => {
                            self.log(
                                LogLevel::Error,
                                format!("{} without usable Digest challenge", response.status),
                            );
                            self.status(LinkState::Disconnected, "Bad challenge");
                            self.teardown_link().await;
                            return;
                        }
                    };
                    authorization = Some(authorization_header(
                        &credential,
                        &challenge,
                        Method::Register.as_str(),
                        &register_uri,
                    ));
                    if let Some(registration) = self.registration.lock().unwrap().as_mut() {
                        registration.challenge = Some(challenge);
                    }
                    auth_sent = true;
                    // the resent REGISTER gets the next CSeq via build_register
                    continue 'cycle;
                }
                200..=299 => {
                    authorization = None;
                    auth_sent = false;
                    let granted = granted_expires(&response).unwrap_or(DEFAULT_EXPIRES);
                    if let Some(registration) = self.registration.lock().unwrap().as_mut() {
                        registration.expires = granted;
                    }
                    info!("registered, expires {}s", granted);
                    self.log(LogLevel::Info, format!("Registered ({}s)", granted));
                    self.status(LinkState::Connected, "Registered");

                    select! {
                        _ = token.cancelled() => return,
                        _ = sleep(refresh_interval(granted)) => {}
                    }
                    // plain refresh so the registrar can issue a fresh nonce
                    continue 'cycle;
                }
                status => {
                    self.log(
                        LogLevel::Error,
                        format!("registration failed: {} {}", status, response.reason),
                    );
                    self.status(
                        LinkState::Disconnected,
                        &format!("{} {}", status, response.reason),
                    );
                    self.teardown_link().await;
                    return;
                }
            }
        }
    }

    pub(crate) async fn unregister(&self) -> Result<()> {
        // stop the refresh loop before competing with it for CSeq
        if let Some(registration) = self.registration.lock().unwrap().as_ref() {
            registration.token.cancel();
        }

        let result = match self.build_register(0, None) {
            Ok(request) => self.send_message(&SipMessage::from(request), None).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.log(LogLevel::Warn, format!("unregister send failed: {}", e));
        }

        // the server's answer is academic: linger briefly, then tear down
        select! {
            _ = self.cancel_token.cancelled() => {}
            _ = sleep(UNREGISTER_LINGER) => {}
        }
        self.teardown_link().await;
        self.status(LinkState::Disconnected, "Unregistered");
        result
    }
}

/// What the registrar actually granted: the Expires header, or an
/// `expires=` parameter on Contact.
fn granted_expires(response: &crate::message::Response) -> Option<u32> {
    if let Some(value) = response.headers.get("expires") {
        if let Ok(parsed) = value.trim().parse() {
            return Some(parsed);
        }
    }
    response
        .headers
        .get("contact")
        .and_then(|contact| param_value(contact, "expires"))
        .and_then(|value| value.parse().ok())
}
