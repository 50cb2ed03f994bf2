use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Severity of a [`Event::Log`] line as rendered by the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Sip,
    Call,
    Warn,
    Error,
    Debug,
}

/// Registrar link state reported on the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

/// Coarse call progress reported to the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Calling,
    Ringing,
    RingingIn,
    Active,
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallPhase::Idle => write!(f, "idle"),
            CallPhase::Calling => write!(f, "calling"),
            CallPhase::Ringing => write!(f, "ringing"),
            CallPhase::RingingIn => write!(f, "ringing-in"),
            CallPhase::Active => write!(f, "active"),
        }
    }
}

/// Everything the core tells the shell. A single consumer receives these in
/// emission order; there are no other callbacks.
#[derive(Debug, Clone)]
pub enum Event {
    Log(LogLevel, String),
    Status(LinkState, String),
    CallState(CallPhase, String),
    /// Decoded 16-bit little-endian PCM, sized to the arriving RTP payload.
    RemoteAudio(Vec<u8>),
}

pub type EventSender = UnboundedSender<Event>;
pub type EventReceiver = UnboundedReceiver<Event>;
