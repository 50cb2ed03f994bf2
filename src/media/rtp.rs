use crate::{Error, Result};

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;

/// The fixed 12-byte RTP header this agent emits and accepts: no padding,
/// no extension, no CSRC list, marker never set on outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub marker: bool,
}

/// `[V|P|X|CC][M|PT][seq be16][ts be32][ssrc be32][payload]`
pub fn build_packet(header: &RtpHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RTP_HEADER_LEN + payload.len());
    buf.push(RTP_VERSION << 6);
    buf.push(header.payload_type & 0x7F);
    buf.extend_from_slice(&header.sequence.to_be_bytes());
    buf.extend_from_slice(&header.timestamp.to_be_bytes());
    buf.extend_from_slice(&header.ssrc.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Parse a datagram into header and payload. Packets shorter than the fixed
/// header or with a foreign version are rejected; CSRC entries and header
/// extensions are assumed absent and not skipped.
pub fn parse_packet(buf: &[u8]) -> Result<(RtpHeader, &[u8])> {
    if buf.len() < RTP_HEADER_LEN {
        return Err(Error::Parse(format!("RTP packet too short: {}", buf.len())));
    }
    let version = buf[0] >> 6;
    if version != RTP_VERSION {
        return Err(Error::Parse(format!("RTP version {}", version)));
    }
    let header = RtpHeader {
        marker: buf[1] & 0x80 != 0,
        payload_type: buf[1] & 0x7F,
        sequence: u16::from_be_bytes([buf[2], buf[3]]),
        timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
    };
    Ok((header, &buf[RTP_HEADER_LEN..]))
}
