use crate::{Error, Result};
use std::net::{IpAddr, SocketAddr};

/// One `m=` block with the attributes that followed it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaDescription {
    pub kind: String,
    pub port: u16,
    /// Payload types in offer order; the first is the negotiated preference.
    pub payload_types: Vec<u8>,
    /// `c=` inside the media block, overriding the session connection.
    pub connection: Option<String>,
    /// `a=rtpmap:<pt> <name>/<rate>` entries.
    pub rtpmaps: Vec<(u8, String)>,
}

/// Minimal session description: the session-level connection address and
/// the media blocks, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDescription {
    pub connection: Option<String>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    /// Line-oriented `type=value` parse. Unknown lines are ignored; `c=`
    /// lines are scoped to the session until the first `m=` opens a media
    /// block.
    pub fn parse(text: &str) -> Result<SessionDescription> {
        let mut session = SessionDescription::default();
        for line in text.lines() {
            let line = line.trim_end_matches('\r').trim();
            if line.len() < 2 || line.as_bytes().get(1) != Some(&b'=') {
                continue;
            }
            let value = &line[2..];
            match line.as_bytes()[0] {
                b'c' => {
                    let ip = connection_ip(value);
                    match session.media.last_mut() {
                        Some(media) => media.connection = ip,
                        None => session.connection = ip,
                    }
                }
                b'm' => {
                    let mut parts = value.split_whitespace();
                    let kind = parts
                        .next()
                        .ok_or_else(|| Error::Parse(format!("bad m= line: {}", line)))?
                        .to_string();
                    let port = parts
                        .next()
                        .and_then(|p| p.parse().ok())
                        .ok_or_else(|| Error::Parse(format!("bad m= port: {}", line)))?;
                    let _proto = parts.next();
                    let payload_types = parts.filter_map(|p| p.parse().ok()).collect();
                    session.media.push(MediaDescription {
                        kind,
                        port,
                        payload_types,
                        connection: None,
                        rtpmaps: Vec::new(),
                    });
                }
                b'a' => {
                    if let Some(rtpmap) = value.strip_prefix("rtpmap:") {
                        if let Some(media) = session.media.last_mut() {
                            let mut parts = rtpmap.split_whitespace();
                            if let (Some(pt), Some(name)) = (
                                parts.next().and_then(|p| p.parse().ok()),
                                parts.next(),
                            ) {
                                media.rtpmaps.push((pt, name.to_string()));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(session)
    }

    pub fn first_audio(&self) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.kind == "audio")
    }

    /// Where to send RTP: the audio block's connection (falling back to the
    /// session connection), its port, and the first offered payload type
    /// (defaulting to PCMU).
    pub fn audio_target(&self) -> Result<(SocketAddr, u8)> {
        let audio = self
            .first_audio()
            .ok_or_else(|| Error::Parse("no audio media in SDP".to_string()))?;
        let ip = audio
            .connection
            .as_deref()
            .or(self.connection.as_deref())
            .ok_or_else(|| Error::Parse("no connection address in SDP".to_string()))?;
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| Error::Parse(format!("bad connection address: {}", ip)))?;
        let pt = audio.payload_types.first().copied().unwrap_or(0);
        Ok((SocketAddr::new(ip, audio.port), pt))
    }
}

fn connection_ip(value: &str) -> Option<String> {
    // c=IN IP4 203.0.113.5
    let mut parts = value.split_whitespace();
    let _net = parts.next();
    let _family = parts.next();
    parts.next().map(|s| s.to_string())
}

/// The offer this agent always makes: one audio stream, PCMU/PCMA plus
/// telephone-event capability, 20 ms packets, sendrecv.
pub fn build_offer(local_ip: IpAddr, rtp_port: u16, user: &str, session_id: u64) -> String {
    format!(
        "v=0\r\n\
         o={user} {sid} {sid} IN IP4 {ip}\r\n\
         s=softsip call\r\n\
         c=IN IP4 {ip}\r\n\
         t=0 0\r\n\
         m=audio {port} RTP/AVP 0 8 101\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=rtpmap:8 PCMA/8000\r\n\
         a=rtpmap:101 telephone-event/8000\r\n\
         a=fmtp:101 0-16\r\n\
         a=ptime:20\r\n\
         a=sendrecv\r\n",
        user = user,
        sid = session_id,
        ip = local_ip,
        port = rtp_port,
    )
}

/// The answer to an offer: echo the first payload type this agent supports
/// (PCMU or PCMA), defaulting to PCMU when the offer lists neither.
pub fn build_answer(
    local_ip: IpAddr,
    rtp_port: u16,
    user: &str,
    session_id: u64,
    offer: &SessionDescription,
) -> (String, u8) {
    let pt = offer
        .first_audio()
        .and_then(|m| m.payload_types.iter().find(|&&pt| pt == 0 || pt == 8))
        .copied()
        .unwrap_or(0);
    let codec = if pt == 8 { "PCMA" } else { "PCMU" };
    let sdp = format!(
        "v=0\r\n\
         o={user} {sid} {sid} IN IP4 {ip}\r\n\
         s=softsip call\r\n\
         c=IN IP4 {ip}\r\n\
         t=0 0\r\n\
         m=audio {port} RTP/AVP {pt} 101\r\n\
         a=rtpmap:{pt} {codec}/8000\r\n\
         a=rtpmap:101 telephone-event/8000\r\n\
         a=fmtp:101 0-16\r\n\
         a=ptime:20\r\n\
         a=sendrecv\r\n",
        user = user,
        sid = session_id,
        ip = local_ip,
        port = rtp_port,
        pt = pt,
        codec = codec,
    );
    (sdp, pt)
}
