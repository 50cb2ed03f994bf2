use crate::{Error, Result};

pub const CNONCE_LEN: usize = 8;

/// Account credentials used to answer Digest challenges.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// A parsed `WWW-Authenticate` / `Proxy-Authenticate` Digest challenge.
///
/// Only MD5 without qop is required; `qop=auth` is honored when offered,
/// anything else is recognized and ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

impl DigestChallenge {
    /// Parse the value of an authenticate header,
    /// e.g. `Digest realm="asterisk", nonce="abc123", algorithm=MD5`.
    pub fn parse(value: &str) -> Result<DigestChallenge> {
        let rest = value
            .trim()
            .strip_prefix("Digest")
            .or_else(|| value.trim().strip_prefix("digest"))
            .ok_or_else(|| Error::Auth(format!("not a Digest challenge: {}", value)))?;

        let mut realm = None;
        let mut nonce = None;
        let mut algorithm = None;
        let mut qop = None;
        let mut opaque = None;

        for item in split_challenge_params(rest) {
            let Some((key, raw)) = item.split_once('=') else {
                continue;
            };
            let val = raw.trim().trim_matches('"').to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "realm" => realm = Some(val),
                "nonce" => nonce = Some(val),
                "algorithm" => algorithm = Some(val),
                "qop" => qop = Some(val),
                "opaque" => opaque = Some(val),
                _ => {}
            }
        }

        Ok(DigestChallenge {
            realm: realm.ok_or_else(|| Error::Auth("challenge without realm".to_string()))?,
            nonce: nonce.ok_or_else(|| Error::Auth("challenge without nonce".to_string()))?,
            algorithm,
            qop,
            opaque,
        })
    }

    fn offers_qop_auth(&self) -> bool {
        self.qop
            .as_deref()
            .map(|q| q.split(',').any(|t| t.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false)
    }
}

/// Split `realm="a,b", nonce="c"` on commas outside quotes.
fn split_challenge_params(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(input[start..].trim());
    parts
}

fn md5_hex(data: &str) -> String {
    format!("{:x}", md5::compute(data.as_bytes()))
}

/// RFC 2617 Digest response: `MD5(HA1:nonce:HA2)`, or the qop=auth form
/// when `cnonce` is given.
pub fn digest_response(
    cred: &Credential,
    challenge: &DigestChallenge,
    method: &str,
    uri: &str,
    cnonce: Option<&str>,
) -> String {
    let ha1 = md5_hex(&format!(
        "{}:{}:{}",
        cred.username, challenge.realm, cred.password
    ));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    match cnonce {
        Some(cnonce) => md5_hex(&format!(
            "{}:{}:00000001:{}:auth:{}",
            ha1, challenge.nonce, cnonce, ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2)),
    }
}

/// Build the `Authorization` header value answering `challenge`. The `uri`
/// must be byte-identical to the request-URI of the resent request.
pub fn authorization_header(
    cred: &Credential,
    challenge: &DigestChallenge,
    method: &str,
    uri: &str,
) -> String {
    let cnonce = if challenge.offers_qop_auth() {
        Some(crate::ua::random_text(CNONCE_LEN))
    } else {
        None
    };
    let response = digest_response(cred, challenge, method, uri, cnonce.as_deref());

    let mut header = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
        cred.username, challenge.realm, challenge.nonce, uri, response
    );
    if let Some(cnonce) = cnonce {
        header.push_str(&format!(", qop=auth, nc=00000001, cnonce=\"{}\"", cnonce));
    }
    if let Some(opaque) = &challenge.opaque {
        header.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    header
}
