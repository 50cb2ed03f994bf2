/// Transport the user agent signals over. Exactly one per agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    /// Uppercase token used in the Via header (`SIP/2.0/UDP ...`).
    pub fn via_token(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }

    /// Lowercase form used in the `transport=` URI parameter.
    pub fn uri_param(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::Udp | TransportKind::Tcp => 5060,
            TransportKind::Tls => 5061,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            "tls" => Some(TransportKind::Tls),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.via_token())
    }
}

/// Account and server settings supplied by the shell.
#[derive(Debug, Clone, Default)]
pub struct PhoneConfig {
    /// Registrar FQDN or IPv4 address.
    pub server: String,
    /// Signaling port. `None` picks the transport default.
    pub port: Option<u16>,
    pub transport: TransportKind,
    /// Local part of the address-of-record.
    pub extension: String,
    pub password: String,
    pub display_name: Option<String>,
}

impl PhoneConfig {
    /// Effective signaling port. A TLS agent configured with the plain SIP
    /// port 5060 is silently moved to 5061.
    pub fn effective_port(&self) -> u16 {
        let port = self.port.unwrap_or_else(|| self.transport.default_port());
        if self.transport == TransportKind::Tls && port == 5060 {
            5061
        } else {
            port
        }
    }

    /// The public identity, `sip:<extension>@<server>`.
    pub fn aor(&self) -> String {
        format!("sip:{}@{}", self.extension, self.server)
    }
}
