//! Blackhole backend - accepts and discards plaintext

use tracing::trace;

use crate::common::{PeerAddress, Result};

use super::Backend;

/// Backend that silently discards all plaintext
#[derive(Debug, Default)]
pub struct BlackholeBackend {
    discarded: u64,
    bytes: u64,
}

impl BlackholeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads discarded so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Backend for BlackholeBackend {
    fn name(&self) -> &'static str {
        "blackhole"
    }

    fn forward(&mut self, peer: &PeerAddress, payload: &[u8]) -> Result<()> {
        trace!("Blackhole: discarding {} bytes from {}", payload.len(), peer);
        self.discarded += 1;
        self.bytes += payload.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blackhole_discards() {
        let mut backend = BlackholeBackend::new();
        let peer = PeerAddress::unspecified();
        backend.forward(&peer, b"hello").unwrap();
        backend.forward(&peer, b"world!").unwrap();
        assert_eq!(backend.discarded(), 2);
        assert_eq!(backend.bytes(), 11);
    }
}
