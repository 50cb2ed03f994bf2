pub mod headers;
pub mod parse;

pub use headers::{canonical_name, Header, Headers};
pub use parse::parse_message;

/// SIP request methods the agent understands. Anything else is carried
/// through as [`Method::Other`] so responses can still echo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Info,
    Notify,
    Other(String),
}

impl Method {
    pub fn from_token(token: &str) -> Method {
        match token.to_ascii_uppercase().as_str() {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            "INFO" => Method::Info,
            "NOTIFY" => Method::Notify,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Notify => "NOTIFY",
            Method::Other(name) => name.as_str(),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The methods advertised in `Allow` headers.
pub const ALLOWED_METHODS: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS, INFO, NOTIFY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

/// `CSeq` header value: sequence number plus the method it numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn parse(value: &str) -> Option<CSeq> {
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = Method::from_token(parts.next()?);
        Some(CSeq { seq, method })
    }
}

impl std::fmt::Display for CSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Request {
        Request {
            method,
            uri: uri.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.headers.get("cseq").and_then(CSeq::parse)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("call-id")
    }

    /// Branch parameter of the topmost Via.
    pub fn via_branch(&self) -> Option<&str> {
        self.headers.get("via").and_then(|v| param_value(v, "branch"))
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.headers.get("from").and_then(|v| param_value(v, "tag"))
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.headers.get("to").and_then(|v| param_value(v, "tag"))
    }
}

impl Response {
    pub fn new(status: u16, reason: impl Into<String>) -> Response {
        Response {
            status,
            reason: reason.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.headers.get("cseq").and_then(CSeq::parse)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("call-id")
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.headers.get("to").and_then(|v| param_value(v, "tag"))
    }
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(r) => &r.headers,
            SipMessage::Response(r) => &r.headers,
        }
    }

    pub fn body(&self) -> &[u8] {
        match self {
            SipMessage::Request(r) => &r.body,
            SipMessage::Response(r) => &r.body,
        }
    }

    /// Wire encoding. `Content-Length` is always recomputed from the body;
    /// any caller-supplied value is discarded.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (start_line, headers, body) = match self {
            SipMessage::Request(r) => (
                format!("{} {} SIP/2.0", r.method, r.uri),
                &r.headers,
                &r.body,
            ),
            SipMessage::Response(r) => (
                format!("SIP/2.0 {} {}", r.status, r.reason),
                &r.headers,
                &r.body,
            ),
        };
        let mut out = Vec::with_capacity(256 + body.len());
        out.extend_from_slice(start_line.as_bytes());
        out.extend_from_slice(b"\r\n");
        for header in headers.iter() {
            if header.name == "content-length" {
                continue;
            }
            out.extend_from_slice(canonical_name(&header.name).as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(header.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        out.extend_from_slice(body);
        out
    }
}

impl From<Request> for SipMessage {
    fn from(r: Request) -> Self {
        SipMessage::Request(r)
    }
}

impl From<Response> for SipMessage {
    fn from(r: Response) -> Self {
        SipMessage::Response(r)
    }
}

impl std::fmt::Display for SipMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// Value of `;name=value` in a header value (tag, branch, ...). The match is
/// case-insensitive on the parameter name; the value runs to the next `;`,
/// `,` or whitespace.
pub fn param_value<'a>(header_value: &'a str, name: &str) -> Option<&'a str> {
    let lower = header_value.to_ascii_lowercase();
    let needle = format!(";{}=", name.to_ascii_lowercase());
    let start = lower.find(&needle)? + needle.len();
    let rest = &header_value[start..];
    let end = rest
        .find(|c: char| c == ';' || c == ',' || c == '>' || c.is_whitespace())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Append `;tag=<tag>` to a From/To value that has no tag yet.
pub fn with_tag(header_value: &str, tag: &str) -> String {
    if param_value(header_value, "tag").is_some() {
        header_value.to_string()
    } else {
        format!("{};tag={}", header_value, tag)
    }
}

/// The URI inside an address header: the `<...>` content if bracketed,
/// otherwise the value up to the first `;`.
pub fn address_uri(header_value: &str) -> &str {
    if let (Some(open), Some(close)) = (header_value.find('<'), header_value.rfind('>')) {
        if open < close {
            return &header_value[open + 1..close];
        }
    }
    match header_value.find(';') {
        Some(semi) => header_value[..semi].trim(),
        None => header_value.trim(),
    }
}
