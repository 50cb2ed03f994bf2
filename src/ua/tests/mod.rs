use crate::auth::{digest_response, Credential, DigestChallenge};
use crate::config::{PhoneConfig, TransportKind};
use crate::event::{CallPhase, Event, EventReceiver, LinkState};
use crate::message::{param_value, Method, Request, Response, SipMessage};
use crate::transport::{ChannelConnection, Connection, TransportEvent};
use crate::ua::{make_response, Link, Registration, UserAgent};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(30);

/// A user agent wired to an in-memory transport: everything it sends lands
/// on `wire`, everything pushed via `push` arrives as if from the server.
struct Harness {
    ua: UserAgent,
    events: EventReceiver,
    wire: UnboundedReceiver<TransportEvent>,
    to_ua: UnboundedSender<TransportEvent>,
    server_addr: SocketAddr,
}

impl Harness {
    fn new() -> Harness {
        let (event_tx, events) = unbounded_channel();
        let config = PhoneConfig {
            server: "pbx.example.com".into(),
            port: None,
            transport: TransportKind::Udp,
            extension: "100".into(),
            password: "secret".into(),
            display_name: Some("Alice".into()),
        };
        let ua = UserAgent::new(config, event_tx);
        let inner = ua.inner().clone();

        let server_addr: SocketAddr = "192.0.2.1:5060".parse().unwrap();
        let local_addr: SocketAddr = "192.0.2.10:5060".parse().unwrap();
        let (to_ua, from_test) = unbounded_channel();
        let (to_test, wire) = unbounded_channel();
        let connection: Connection =
            ChannelConnection::create_connection(from_test, to_test, local_addr).into();

        let token = inner.cancel_token.child_token();
        *inner.link.lock().unwrap() = Some(Link {
            connection: connection.clone(),
            server_addr,
            local_ip: local_addr.ip(),
            local_port: local_addr.port(),
            token: token.clone(),
        });

        let (sender, receiver) = unbounded_channel();
        let serve_token = token.clone();
        tokio::spawn(async move {
            select! {
                _ = serve_token.cancelled() => {}
                _ = connection.serve_loop(sender) => {}
            }
        });
        tokio::spawn(inner.clone().dispatch_loop(receiver, token));

        Harness {
            ua,
            events,
            wire,
            to_ua,
            server_addr,
        }
    }

    fn start_registration(&self) {
        let inner = self.ua.inner().clone();
        let link_token = inner.link.lock().unwrap().as_ref().unwrap().token.clone();
        let reg_token = link_token.child_token();
        *inner.registration.lock().unwrap() = Some(Registration::new(reg_token.clone()));
        tokio::spawn(inner.clone().registration_loop(reg_token));
    }

    fn push(&self, msg: impl Into<SipMessage>) {
        self.to_ua
            .send(TransportEvent::Incoming(msg.into(), self.server_addr))
            .unwrap();
    }

    async fn sent(&mut self) -> SipMessage {
        let event = timeout(WAIT, self.wire.recv())
            .await
            .expect("timed out waiting for an outbound message")
            .expect("wire closed");
        match event {
            TransportEvent::Incoming(msg, _) => msg,
            TransportEvent::Closed => panic!("unexpected Closed on wire"),
        }
    }

    async fn sent_request(&mut self) -> Request {
        match self.sent().await {
            SipMessage::Request(request) => request,
            other => panic!("expected a request, got {}", other),
        }
    }

    async fn sent_response(&mut self) -> Response {
        match self.sent().await {
            SipMessage::Response(response) => response,
            other => panic!("expected a response, got {}", other),
        }
    }

    async fn status_event(&mut self) -> (LinkState, String) {
        loop {
            let event = timeout(WAIT, self.events.recv())
                .await
                .expect("timed out waiting for a status event")
                .expect("event channel closed");
            if let Event::Status(state, text) = event {
                return (state, text);
            }
        }
    }

    async fn call_event(&mut self) -> (CallPhase, String) {
        loop {
            let event = timeout(WAIT, self.events.recv())
                .await
                .expect("timed out waiting for a call event")
                .expect("event channel closed");
            if let Event::CallState(phase, text) = event {
                return (phase, text);
            }
        }
    }
}

/// Echo a response the way a registrar/peer would: Via, From, To (+tag),
/// Call-ID and CSeq copied from the request.
fn reply(request: &Request, status: u16, reason: &str, to_tag: Option<&str>) -> Response {
    make_response(request, status, reason, to_tag)
}

const ANSWER_SDP: &str = "v=0\r\n\
    o=- 1 1 IN IP4 203.0.113.5\r\n\
    s=-\r\n\
    c=IN IP4 203.0.113.5\r\n\
    t=0 0\r\n\
    m=audio 40000 RTP/AVP 0\r\n\
    a=rtpmap:0 PCMU/8000\r\n";

fn inbound_invite(call_id: &str) -> Request {
    let mut request = Request::new(Method::Invite, "sip:100@192.0.2.10:5060");
    request.headers.push(
        "Via",
        format!("SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKsrv{}", call_id),
    );
    request.headers.push("Max-Forwards", "70");
    request
        .headers
        .push("From", "\"Bob\" <sip:200@pbx.example.com>;tag=peer200");
    request.headers.push("To", "<sip:100@pbx.example.com>");
    request.headers.push("Call-ID", call_id.to_string());
    request.headers.push("CSeq", "1 INVITE");
    request.headers.push("Contact", "<sip:200@192.0.2.1:5060>");
    request.headers.push("Content-Type", "application/sdp");
    request.body = "v=0\r\n\
        o=bob 2 2 IN IP4 192.0.2.99\r\n\
        s=-\r\n\
        c=IN IP4 192.0.2.99\r\n\
        t=0 0\r\n\
        m=audio 45000 RTP/AVP 0 8\r\n\
        a=rtpmap:0 PCMU/8000\r\n"
        .as_bytes()
        .to_vec();
    request
}

#[tokio::test(start_paused = true)]
async fn register_handles_digest_challenge_and_refreshes() {
    let mut h = Harness::new();
    h.start_registration();

    let first = h.sent_request().await;
    assert_eq!(first.method, Method::Register);
    assert_eq!(first.uri, "sip:pbx.example.com");
    assert_eq!(first.cseq().unwrap().seq, 1);
    assert_eq!(first.headers.get("expires"), Some("300"));
    assert!(first.headers.get("authorization").is_none());
    assert!(first.via_branch().unwrap().starts_with("z9hG4bK"));
    let call_id = first.call_id().unwrap().to_string();
    let from_tag = first.from_tag().unwrap().to_string();

    let mut challenge = reply(&first, 401, "Unauthorized", None);
    challenge.headers.push(
        "WWW-Authenticate",
        "Digest realm=\"asterisk\", nonce=\"abc123\"",
    );
    h.push(challenge);

    let second = h.sent_request().await;
    assert_eq!(second.cseq().unwrap().seq, 2, "challenged resend bumps CSeq");
    assert_eq!(second.call_id(), Some(call_id.as_str()));
    assert_eq!(second.from_tag(), Some(from_tag.as_str()), "stable local tag");

    let authorization = second.headers.get("authorization").expect("Authorization");
    let expected = digest_response(
        &Credential {
            username: "100".into(),
            password: "secret".into(),
        },
        &DigestChallenge {
            realm: "asterisk".into(),
            nonce: "abc123".into(),
            algorithm: None,
            qop: None,
            opaque: None,
        },
        "REGISTER",
        "sip:pbx.example.com",
        None,
    );
    assert!(
        authorization.contains(&format!("response=\"{}\"", expected)),
        "digest mismatch in {}",
        authorization
    );
    assert!(authorization.contains("uri=\"sip:pbx.example.com\""));
    assert!(authorization.contains("username=\"100\""));

    let mut ok = reply(&second, 200, "OK", None);
    ok.headers.push("Expires", "300");
    h.push(ok);

    let (state, text) = h.status_event().await;
    assert_eq!(state, LinkState::Connected);
    assert_eq!(text, "Registered");

    // the refresh fires at 5/6 of the granted 300 s, unauthenticated
    let refresh = timeout(Duration::from_secs(400), h.wire.recv())
        .await
        .expect("no refresh REGISTER within the cadence")
        .expect("wire closed");
    let refresh = match refresh {
        TransportEvent::Incoming(SipMessage::Request(request), _) => request,
        other => panic!("expected the refresh REGISTER, got {:?}", other),
    };
    assert_eq!(refresh.method, Method::Register);
    assert_eq!(refresh.cseq().unwrap().seq, 3);
    assert_eq!(refresh.call_id(), Some(call_id.as_str()));
    assert!(refresh.headers.get("authorization").is_none());
}

#[tokio::test(start_paused = true)]
async fn unregister_sends_expires_zero_then_disconnects() {
    let mut h = Harness::new();
    h.start_registration();

    let first = h.sent_request().await;
    let mut ok = reply(&first, 200, "OK", None);
    ok.headers.push("Expires", "300");
    h.push(ok);
    let (state, _) = h.status_event().await;
    assert_eq!(state, LinkState::Connected);

    h.ua.unregister().await.expect("unregister");

    let goodbye = h.sent_request().await;
    assert_eq!(goodbye.method, Method::Register);
    assert_eq!(goodbye.headers.get("expires"), Some("0"));
    assert_eq!(goodbye.cseq().unwrap().seq, 2, "goodbye continues the CSeq run");
    assert_eq!(goodbye.call_id(), first.call_id());

    let (state, text) = h.status_event().await;
    assert_eq!(state, LinkState::Disconnected);
    assert_eq!(text, "Unregistered");
    assert!(h.ua.inner().link.lock().unwrap().is_none(), "transport torn down");
}

#[tokio::test(start_paused = true)]
async fn register_gives_up_after_three_silent_attempts() {
    let mut h = Harness::new();
    h.start_registration();

    let first = h.sent_request().await;
    let second = h.sent_request().await;
    let third = h.sent_request().await;
    // retransmissions, not new transactions
    assert_eq!(first.cseq().unwrap().seq, 1);
    assert_eq!(second.cseq().unwrap().seq, 1);
    assert_eq!(third.cseq().unwrap().seq, 1);
    assert_eq!(first.via_branch(), second.via_branch());

    let (state, _) = h.status_event().await;
    // the Connecting status is not emitted by the loop; first status is the failure
    assert_eq!(state, LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn register_rejection_disconnects() {
    let mut h = Harness::new();
    h.start_registration();

    let first = h.sent_request().await;
    h.push(reply(&first, 403, "Forbidden", None));

    let (state, text) = h.status_event().await;
    assert_eq!(state, LinkState::Disconnected);
    assert!(text.contains("403"));
}

#[tokio::test]
async fn outbound_call_reaches_active_and_hangs_up() {
    let mut h = Harness::new();

    h.ua.invite("bob").await.expect("invite");
    let (phase, _) = h.call_event().await;
    assert_eq!(phase, CallPhase::Calling);

    let invite = h.sent_request().await;
    assert_eq!(invite.method, Method::Invite);
    assert_eq!(invite.uri, "sip:bob@pbx.example.com");
    assert_eq!(invite.cseq().unwrap().seq, 1);
    assert_eq!(invite.headers.get("content-type"), Some("application/sdp"));
    let body = String::from_utf8(invite.body.clone()).unwrap();
    assert!(body.contains("m=audio"));
    assert!(body.contains("RTP/AVP 0 8 101"));
    assert!(body.contains("a=sendrecv"));
    let contact = invite.headers.get("contact").unwrap();
    assert!(contact.contains("transport=udp"));
    let invite_branch = invite.via_branch().unwrap().to_string();

    h.push(reply(&invite, 180, "Ringing", Some("remote1")));
    let (phase, _) = h.call_event().await;
    assert_eq!(phase, CallPhase::Ringing);

    let mut ok = reply(&invite, 200, "OK", Some("remote1"));
    ok.headers.push("Contact", "<sip:bob@192.0.2.1:5060>");
    ok.headers.push("Content-Type", "application/sdp");
    ok.body = ANSWER_SDP.as_bytes().to_vec();
    h.push(ok);

    let ack = h.sent_request().await;
    assert_eq!(ack.method, Method::Ack);
    let ack_cseq = ack.cseq().unwrap();
    assert_eq!(ack_cseq.seq, 1, "ACK reuses the INVITE CSeq number");
    assert_eq!(ack_cseq.method, Method::Ack);
    assert_ne!(
        ack.via_branch().unwrap(),
        invite_branch,
        "ACK to 2xx is a new transaction"
    );
    assert_eq!(param_value(ack.headers.get("to").unwrap(), "tag"), Some("remote1"));
    assert_eq!(ack.uri, "sip:bob@192.0.2.1:5060");

    let (phase, _) = h.call_event().await;
    assert_eq!(phase, CallPhase::Active);

    {
        let inner = h.ua.inner();
        let guard = inner.call.lock().unwrap();
        let call = guard.as_ref().expect("call");
        let rtp = call.rtp.as_ref().expect("rtp");
        assert_eq!(rtp.remote(), Some("203.0.113.5:40000".parse().unwrap()));
    }

    assert!(h.ua.toggle_mute());
    assert!(!h.ua.toggle_mute());

    h.ua.send_dtmf('5').await.expect("dtmf");
    let info = h.sent_request().await;
    assert_eq!(info.method, Method::Info);
    assert_eq!(info.cseq().unwrap().seq, 2);
    assert_eq!(
        info.headers.get("content-type"),
        Some("application/dtmf-relay")
    );
    assert_eq!(info.body, b"Signal=5\r\nDuration=160\r\n");

    h.ua.hangup().await.expect("hangup");
    let bye = h.sent_request().await;
    assert_eq!(bye.method, Method::Bye);
    assert_eq!(bye.cseq().unwrap().seq, 3);
    assert_eq!(param_value(bye.headers.get("to").unwrap(), "tag"), Some("remote1"));

    let (phase, text) = h.call_event().await;
    assert_eq!(phase, CallPhase::Idle);
    assert_eq!(text, "Hung up");
}

#[tokio::test]
async fn outbound_call_answers_challenge_then_failure_acks_on_invite_branch() {
    let mut h = Harness::new();

    h.ua.invite("200").await.expect("invite");
    let invite = h.sent_request().await;
    let first_branch = invite.via_branch().unwrap().to_string();

    let mut challenge = reply(&invite, 407, "Proxy Authentication Required", Some("r407"));
    challenge.headers.push(
        "Proxy-Authenticate",
        "Digest realm=\"asterisk\", nonce=\"n407\"",
    );
    h.push(challenge);

    // non-2xx ACK stays in the INVITE's transaction
    let ack = h.sent_request().await;
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.via_branch().unwrap(), first_branch);
    assert_eq!(ack.cseq().unwrap().seq, 1);

    let retry = h.sent_request().await;
    assert_eq!(retry.method, Method::Invite);
    assert_eq!(retry.cseq().unwrap().seq, 2, "auth resend bumps CSeq");
    assert_ne!(retry.via_branch().unwrap(), first_branch);
    assert_eq!(retry.call_id(), invite.call_id());
    assert_eq!(retry.from_tag(), invite.from_tag());
    assert!(retry
        .headers
        .get("authorization")
        .unwrap()
        .contains("nonce=\"n407\""));
    let retry_branch = retry.via_branch().unwrap().to_string();

    h.push(reply(&retry, 486, "Busy Here", Some("r486")));
    let ack = h.sent_request().await;
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.via_branch().unwrap(), retry_branch);
    assert_eq!(ack.cseq().unwrap().seq, 2);

    // swallow the Calling event, then expect the failure
    loop {
        let (phase, text) = h.call_event().await;
        if phase == CallPhase::Idle {
            assert!(text.contains("486"));
            break;
        }
    }
}

#[tokio::test]
async fn inbound_invite_rings_then_cancel_gets_487() {
    let mut h = Harness::new();

    let invite = inbound_invite("inbound-cancel-1");
    h.push(invite.clone());

    let trying = h.sent_response().await;
    assert_eq!(trying.status, 100);
    assert_eq!(trying.to_tag(), None, "100 Trying carries no To tag");
    assert_eq!(
        trying.headers.get("via"),
        invite.headers.get("via"),
        "Via echoed verbatim"
    );

    let ringing = h.sent_response().await;
    assert_eq!(ringing.status, 180);
    let local_tag = ringing.to_tag().expect("180 adds a local tag").to_string();
    assert!(ringing.headers.get("contact").is_some());
    assert_eq!(ringing.headers.get("cseq"), Some("1 INVITE"));
    assert_eq!(ringing.headers.get("from"), invite.headers.get("from"));

    let (phase, _) = h.call_event().await;
    assert_eq!(phase, CallPhase::RingingIn);

    // CANCEL on the INVITE's branch
    let mut cancel = Request::new(Method::Cancel, "sip:100@192.0.2.10:5060");
    for name in ["via", "from", "to", "call-id"] {
        cancel
            .headers
            .push(name, invite.headers.get(name).unwrap().to_string());
    }
    cancel.headers.push("CSeq", "1 CANCEL");
    h.push(cancel);

    let ok = h.sent_response().await;
    assert_eq!(ok.status, 200);
    assert_eq!(ok.headers.get("cseq"), Some("1 CANCEL"));

    let terminated = h.sent_response().await;
    assert_eq!(terminated.status, 487);
    assert_eq!(terminated.headers.get("cseq"), Some("1 INVITE"));
    assert_eq!(
        terminated.to_tag(),
        Some(local_tag.as_str()),
        "487 keeps the tag the 180 introduced"
    );

    let (phase, text) = h.call_event().await;
    assert_eq!(phase, CallPhase::Idle);
    assert_eq!(text, "Cancelled");
}

#[tokio::test]
async fn inbound_call_answered_then_remote_bye() {
    let mut h = Harness::new();

    h.push(inbound_invite("inbound-answer-1"));
    let _trying = h.sent_response().await;
    let ringing = h.sent_response().await;
    let local_tag = ringing.to_tag().unwrap().to_string();
    let (phase, _) = h.call_event().await;
    assert_eq!(phase, CallPhase::RingingIn);

    h.ua.answer().await.expect("answer");
    let ok = h.sent_response().await;
    assert_eq!(ok.status, 200);
    assert_eq!(ok.to_tag(), Some(local_tag.as_str()));
    let body = String::from_utf8(ok.body.clone()).unwrap();
    assert!(body.contains("m=audio"));
    assert!(body.contains("RTP/AVP 0 101"), "echoes the first common PT");

    let (phase, _) = h.call_event().await;
    assert_eq!(phase, CallPhase::Active);

    // peer hangs up
    let mut bye = Request::new(Method::Bye, "sip:100@192.0.2.10:5060");
    bye.headers
        .push("Via", "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKbye1");
    bye.headers
        .push("From", "\"Bob\" <sip:200@pbx.example.com>;tag=peer200");
    bye.headers
        .push("To", format!("<sip:100@pbx.example.com>;tag={}", local_tag));
    bye.headers.push("Call-ID", "inbound-answer-1");
    bye.headers.push("CSeq", "2 BYE");
    h.push(bye);

    let ok = h.sent_response().await;
    assert_eq!(ok.status, 200);
    assert_eq!(ok.headers.get("cseq"), Some("2 BYE"));

    let (phase, text) = h.call_event().await;
    assert_eq!(phase, CallPhase::Idle);
    assert_eq!(text, "Remote hung up");
}

#[tokio::test]
async fn second_invite_is_busy_without_touching_the_call() {
    let mut h = Harness::new();

    h.push(inbound_invite("first-call"));
    let _trying = h.sent_response().await;
    let _ringing = h.sent_response().await;
    let (phase, _) = h.call_event().await;
    assert_eq!(phase, CallPhase::RingingIn);

    h.push(inbound_invite("second-call"));
    let busy = h.sent_response().await;
    assert_eq!(busy.status, 486);
    assert_eq!(busy.call_id(), Some("second-call"));
    assert!(busy.to_tag().is_some());

    // the first call is still ringing
    let inner = h.ua.inner();
    let guard = inner.call.lock().unwrap();
    let call = guard.as_ref().expect("call still present");
    assert_eq!(call.call_id, "first-call");
}

#[tokio::test]
async fn options_and_notify_get_200_with_allow() {
    let mut h = Harness::new();

    let mut options = Request::new(Method::Options, "sip:100@192.0.2.10:5060");
    options
        .headers
        .push("Via", "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKopt1");
    options.headers.push("From", "<sip:pbx@pbx.example.com>;tag=px1");
    options.headers.push("To", "<sip:100@pbx.example.com>");
    options.headers.push("Call-ID", "options-1");
    options.headers.push("CSeq", "7 OPTIONS");
    h.push(options);

    let response = h.sent_response().await;
    assert_eq!(response.status, 200);
    assert!(response.to_tag().is_some(), "OPTIONS answer gets a fresh tag");
    assert!(response.headers.get("allow").unwrap().contains("INVITE"));

    let mut notify = Request::new(Method::Notify, "sip:100@192.0.2.10:5060");
    notify
        .headers
        .push("Via", "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKntf1");
    notify.headers.push("From", "<sip:pbx@pbx.example.com>;tag=px2");
    notify.headers.push("To", "<sip:100@pbx.example.com>");
    notify.headers.push("Call-ID", "notify-1");
    notify.headers.push("CSeq", "8 NOTIFY");
    h.push(notify);

    let response = h.sent_response().await;
    assert_eq!(response.status, 200);
    assert!(response.headers.get("allow").is_some());
    assert_eq!(response.headers.get("cseq"), Some("8 NOTIFY"));
}

#[tokio::test]
async fn stop_is_idempotent_and_silences_events() {
    let mut h = Harness::new();

    h.push(inbound_invite("stop-call"));
    let _trying = h.sent_response().await;
    let _ringing = h.sent_response().await;
    let (phase, _) = h.call_event().await;
    assert_eq!(phase, CallPhase::RingingIn);

    h.ua.stop().await;
    h.ua.stop().await;

    let mut saw_stopped = false;
    while let Ok(event) = h.events.try_recv() {
        if let Event::CallState(CallPhase::Idle, text) = event {
            assert_eq!(text, "Stopped");
            saw_stopped = true;
        }
    }
    assert!(saw_stopped, "call termination event missing");
    assert!(h.ua.inner().call.lock().unwrap().is_none());
}
