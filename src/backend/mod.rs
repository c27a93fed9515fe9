//! Backend Forwarding
//!
//! Responsibilities:
//! - Receive plaintext the engine decrypted for a peer
//! - Hand it to whatever sits behind the proxy
//!
//! Forwarding is synchronous and non-blocking: it runs inside the engine's
//! deliver callback on the dispatch path. Failures are reported to the
//! caller, which logs and drops; nothing here is retried.

mod blackhole;
mod udp;

pub use blackhole::BlackholeBackend;
pub use udp::UdpBackend;

use crate::common::{PeerAddress, Result};

/// Plaintext sink behind the proxy
pub trait Backend: Send {
    /// Backend name, for logs
    fn name(&self) -> &'static str;

    /// Forward one plaintext payload received from `peer`
    fn forward(&mut self, peer: &PeerAddress, payload: &[u8]) -> Result<()>;
}
