use super::codec;
use super::rtp::{build_packet, parse_packet, RtpHeader};
use crate::event::{Event, EventSender, LogLevel};
use crate::Result;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SAMPLE_RATE: u32 = 8000;
pub const PTIME: Duration = Duration::from_millis(20);
pub const SAMPLES_PER_PACKET: usize = 160;

pub const PT_PCMU: u8 = 0;
pub const PT_PCMA: u8 = 8;

struct TxState {
    sequence: u16,
    timestamp: u32,
    payload_type: u8,
    remote: Option<SocketAddr>,
    active: bool,
    muted: bool,
    /// Whether symmetric-RTP learning has locked the remote endpoint.
    learned: bool,
    queue: VecDeque<Vec<u8>>,
}

struct RtpSessionInner {
    socket: UdpSocket,
    local_port: u16,
    ssrc: u32,
    events: EventSender,
    cancel_token: CancellationToken,
    state: Mutex<TxState>,
}

/// One RTP audio session: a UDP socket, a 20 ms send cadence, and a receive
/// loop decoding G.711 into [`Event::RemoteAudio`].
///
/// The SSRC is chosen at construction and never changes; sequence and
/// timestamp advance by exactly 1 and 160 per packet sent, muted or not.
#[derive(Clone)]
pub struct RtpSession {
    inner: Arc<RtpSessionInner>,
}

impl RtpSession {
    /// Bind a fresh socket on an ephemeral port. No traffic flows until
    /// [`start`](Self::start).
    pub async fn bind(events: EventSender) -> Result<RtpSession> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let local_port = socket.local_addr()?.port();
        let session = RtpSession {
            inner: Arc::new(RtpSessionInner {
                socket,
                local_port,
                ssrc: rand::random::<u32>(),
                events,
                cancel_token: CancellationToken::new(),
                state: Mutex::new(TxState {
                    sequence: rand::random::<u16>(),
                    timestamp: rand::random::<u32>(),
                    payload_type: PT_PCMU,
                    remote: None,
                    active: false,
                    muted: false,
                    learned: false,
                    queue: VecDeque::new(),
                }),
            }),
        };
        debug!("RTP socket bound on port {}", local_port);
        Ok(session)
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_port
    }

    pub fn ssrc(&self) -> u32 {
        self.inner.ssrc
    }

    /// Begin paced emission toward `remote` and start decoding inbound
    /// packets. Calling twice is a no-op.
    pub fn start(&self, remote: SocketAddr, payload_type: u8) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.active {
                return;
            }
            state.remote = Some(remote);
            state.payload_type = payload_type;
            state.active = true;
        }
        info!(
            "RTP session started: ssrc={:#010x} pt={} -> {}",
            self.inner.ssrc, payload_type, remote
        );

        let sender = self.inner.clone();
        tokio::spawn(async move { sender.send_loop().await });
        let receiver = self.inner.clone();
        tokio::spawn(async move { receiver.recv_loop().await });
    }

    /// Queue one block of 16-bit LE PCM for transmission. Blocks are encoded
    /// whole, one per tick; 160 samples (320 bytes) fills a tick exactly.
    pub fn feed_mic(&self, pcm: &[u8]) {
        if pcm.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock().unwrap();
        if state.active && !state.muted {
            state.queue.push_back(pcm.to_vec());
        }
    }

    pub fn set_muted(&self, muted: bool) {
        let mut state = self.inner.state.lock().unwrap();
        state.muted = muted;
        if muted {
            state.queue.clear();
        }
    }

    pub fn is_muted(&self) -> bool {
        self.inner.state.lock().unwrap().muted
    }

    /// Re-target outbound packets without disturbing sequence, timestamp or
    /// SSRC.
    pub fn update_remote(&self, remote: SocketAddr) {
        self.inner.state.lock().unwrap().remote = Some(remote);
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.inner.state.lock().unwrap().remote
    }

    /// Stop the timers and close the session. Idempotent; no events are
    /// emitted after this returns.
    pub fn close(&self) {
        let was_active = {
            let mut state = self.inner.state.lock().unwrap();
            let was = state.active;
            state.active = false;
            state.queue.clear();
            was
        };
        self.inner.cancel_token.cancel();
        if was_active {
            debug!("RTP session closed: ssrc={:#010x}", self.inner.ssrc);
        }
    }
}

impl RtpSessionInner {
    fn emit(&self, event: Event) {
        if !self.cancel_token.is_cancelled() {
            self.events.send(event).ok();
        }
    }

    /// Wall-clock paced sender. `tokio::time::interval` schedules each tick
    /// from the original baseline, so drift does not accumulate.
    async fn send_loop(&self) {
        let mut ticker = tokio::time::interval(PTIME);
        loop {
            select! {
                _ = self.cancel_token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let (packet, remote) = {
                let mut state = self.state.lock().unwrap();
                if !state.active {
                    return;
                }
                let remote = match state.remote {
                    Some(remote) => remote,
                    None => continue,
                };
                let payload = match state.queue.pop_front() {
                    Some(block) if !state.muted => encode_block(state.payload_type, &block),
                    _ => vec![silence_byte(state.payload_type); SAMPLES_PER_PACKET],
                };
                let header = RtpHeader {
                    payload_type: state.payload_type,
                    sequence: state.sequence,
                    timestamp: state.timestamp,
                    ssrc: self.ssrc,
                    marker: false,
                };
                state.sequence = state.sequence.wrapping_add(1);
                state.timestamp = state.timestamp.wrapping_add(SAMPLES_PER_PACKET as u32);
                (build_packet(&header, &payload), remote)
            };

            if let Err(e) = self.socket.send_to(&packet, remote).await {
                warn!("RTP send to {} failed: {}", remote, e);
                self.emit(Event::Log(
                    LogLevel::Warn,
                    format!("RTP send failed: {}", e),
                ));
            }
        }
    }

    async fn recv_loop(&self) {
        let mut buf = vec![0u8; 2048];
        loop {
            let (len, source) = select! {
                _ = self.cancel_token.cancelled() => return,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("RTP receive error: {}", e);
                        self.emit(Event::Log(
                            LogLevel::Warn,
                            format!("RTP receive failed: {}", e),
                        ));
                        continue;
                    }
                },
            };

            let (header, payload) = match parse_packet(&buf[..len]) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };

            self.learn_remote(source);

            let pcm = match header.payload_type {
                PT_PCMU => codec::decode_mulaw(payload),
                PT_PCMA => codec::decode_alaw(payload),
                _ => continue,
            };
            self.emit(Event::RemoteAudio(pcm));
        }
    }

    /// Symmetric RTP: the first valid inbound packet fixes the real remote
    /// endpoint, which may differ from what the peer's SDP advertised.
    fn learn_remote(&self, source: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        if state.learned {
            return;
        }
        state.learned = true;
        let advertised = state.remote;
        let unusable = advertised.map_or(true, |a| a.ip().is_unspecified());
        if unusable || advertised != Some(source) {
            state.remote = Some(source);
            drop(state);
            info!("learned symmetric RTP endpoint: {}", source);
            self.emit(Event::Log(
                LogLevel::Info,
                format!("RTP: learned remote endpoint {}", source),
            ));
        }
    }
}

fn silence_byte(payload_type: u8) -> u8 {
    if payload_type == PT_PCMA {
        codec::ALAW_SILENCE
    } else {
        codec::MULAW_SILENCE
    }
}

fn encode_block(payload_type: u8, pcm: &[u8]) -> Vec<u8> {
    if payload_type == PT_PCMA {
        codec::encode_alaw(pcm)
    } else {
        codec::encode_mulaw(pcm)
    }
}
