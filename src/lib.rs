// A single-user SIP softphone core in Rust
pub type Result<T> = std::result::Result<T, crate::error::Error>;
pub use crate::error::Error;
pub mod auth;
pub mod config;
pub mod error;
pub mod event;
pub mod media;
pub mod message;
pub mod sdp;
pub mod transport;
pub mod ua;
pub use config::{PhoneConfig, TransportKind};
pub use event::{CallPhase, Event, LinkState, LogLevel};
pub use ua::UserAgent;
