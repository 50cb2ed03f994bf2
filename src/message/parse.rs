use super::{Headers, Method, Request, Response, SipMessage};
use crate::{Error, Result};

/// Parse one whole SIP message from a buffer.
///
/// Tolerant and line-based: the head is split on CRLF (bare LF accepted),
/// header names are lowercased, values trimmed, duplicates kept in order.
/// When `Content-Length` is present the body is exactly that many bytes;
/// otherwise the remainder of the buffer is the body.
pub fn parse_message(data: &[u8]) -> Result<SipMessage> {
    let (head, rest) = split_head(data);
    let head = std::str::from_utf8(head)
        .map_err(|e| Error::Parse(format!("message head is not UTF-8: {}", e)))?;

    let mut lines = head.lines();
    let start_line = lines
        .next()
        .ok_or_else(|| Error::Parse("empty SIP message".to_string()))?
        .trim_end_matches('\r')
        .trim();
    if start_line.is_empty() {
        return Err(Error::Parse("empty start line".to_string()));
    }

    let mut headers = Headers::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        // tolerate junk lines rather than rejecting the whole message
        if let Some((name, value)) = line.split_once(':') {
            headers.push(name.trim(), value.trim().to_string());
        }
    }

    let body = match headers.get("content-length").and_then(|v| v.parse::<usize>().ok()) {
        Some(len) => rest[..len.min(rest.len())].to_vec(),
        None => rest.to_vec(),
    };

    if let Some(rest_of_line) = start_line.strip_prefix("SIP/2.0") {
        let mut parts = rest_of_line.trim_start().splitn(2, ' ');
        let status: u16 = parts
            .next()
            .unwrap_or_default()
            .parse()
            .map_err(|_| Error::Parse(format!("bad status line: {}", start_line)))?;
        let reason = parts.next().unwrap_or_default().trim().to_string();
        Ok(SipMessage::Response(Response {
            status,
            reason,
            headers,
            body,
        }))
    } else {
        let mut parts = start_line.split_whitespace();
        let method = parts
            .next()
            .map(Method::from_token)
            .ok_or_else(|| Error::Parse("missing method".to_string()))?;
        let uri = parts
            .next()
            .ok_or_else(|| Error::Parse(format!("bad request line: {}", start_line)))?
            .to_string();
        match parts.next() {
            Some("SIP/2.0") => {}
            other => {
                return Err(Error::Parse(format!(
                    "unsupported SIP version: {:?}",
                    other
                )))
            }
        }
        Ok(SipMessage::Request(Request {
            method,
            uri,
            headers,
            body,
        }))
    }
}

fn split_head(data: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find_header_end(data) {
        (&data[..pos], &data[pos + 4..])
    } else {
        (data, &[][..])
    }
}

/// Offset of the `\r\n\r\n` separating headers from body, if present.
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}
