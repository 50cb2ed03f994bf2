pub mod codec;
pub mod rtp;
pub mod session;

pub use session::{RtpSession, PTIME, PT_PCMA, PT_PCMU, SAMPLES_PER_PACKET, SAMPLE_RATE};

#[cfg(test)]
mod tests;
