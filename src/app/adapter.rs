//! Secure-Channel Adapter
//!
//! The proxy side of the engine callbacks. One adapter is built for every
//! inbound datagram, borrowing the socket, the credential store and the
//! backend from the proxy, and is handed to `ChannelEngine::handle_message`.
//!
//! ```text
//! engine.send()               → try_send_to on the shared socket
//! engine.deliver()            → Backend::forward
//! engine.event()              → logged; fatal alerts mark the peer for eviction
//! engine.resolve_credential() → CredentialStore lookups
//! ```
//!
//! The adapter cannot remove sessions itself while the engine is still
//! running on one; evictions are collected in the `DispatchReport` and
//! carried out by the proxy as soon as the engine returns.

use std::io::{self, ErrorKind};

use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, warn};

use crate::backend::Backend;
use crate::common::PeerAddress;
use crate::credential::CredentialStore;
use crate::engine::{
    AlertDescription, ChannelEvent, ChannelHandler, CredentialRequest, FatalAlert,
};

use super::metrics::{
    ALERTS_TOTAL, BACKEND_FAILURES, BYTES_SENT, CREDENTIAL_LOOKUPS, DATAGRAMS_SENT,
    HANDSHAKES_COMPLETED, PLAINTEXT_BYTES_DELIVERED, SEND_FAILURES,
};

/// What the engine did while processing one datagram
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Events in the order the engine raised them
    pub events: Vec<ChannelEvent>,
    pub datagrams_sent: usize,
    pub bytes_sent: usize,
    pub send_failures: usize,
    pub payloads_delivered: usize,
    pub bytes_delivered: usize,
    pub backend_failures: usize,
    /// Peers that received a fatal alert, to be evicted
    pub evictions: Vec<(PeerAddress, AlertDescription)>,
}

impl DispatchReport {
    /// Number of completed handshakes observed
    pub fn connected_events(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, ChannelEvent::Connected))
            .count()
    }

    /// Fatal alert recorded for `peer`, if any
    pub fn eviction_for(&self, peer: &PeerAddress) -> Option<AlertDescription> {
        self.evictions
            .iter()
            .find(|(p, _)| p == peer)
            .map(|(_, description)| *description)
    }
}

/// Engine callback implementation
pub struct ChannelAdapter<'a> {
    socket: &'a UdpSocket,
    credentials: &'a CredentialStore,
    backend: &'a mut dyn Backend,
    report: DispatchReport,
}

impl<'a> ChannelAdapter<'a> {
    pub fn new(
        socket: &'a UdpSocket,
        credentials: &'a CredentialStore,
        backend: &'a mut dyn Backend,
    ) -> Self {
        Self {
            socket,
            credentials,
            backend,
            report: DispatchReport::default(),
        }
    }

    /// Consume the adapter, returning what happened
    pub fn finish(self) -> DispatchReport {
        self.report
    }

    fn resolve_identity(
        &self,
        peer: &PeerAddress,
        claimed: &[u8],
        out: &mut [u8],
    ) -> Result<usize, FatalAlert> {
        if !claimed.is_empty() {
            debug!(
                "[{}] PSK identity offered: '{}'",
                peer,
                String::from_utf8_lossy(claimed)
            );
        }

        let credential = match self.credentials.lookup_by_identity(claimed) {
            Some(c) => c,
            None => {
                warn!("[{}] No PSK for offered identity", peer);
                return Err(FatalAlert(AlertDescription::CloseNotify));
            }
        };

        credential.write_identity(out).map_err(|e| {
            error!("[{}] Cannot set PSK identity: {}", peer, e);
            FatalAlert(AlertDescription::InternalError)
        })
    }

    fn resolve_key(
        &self,
        peer: &PeerAddress,
        identity: &[u8],
        out: &mut [u8],
    ) -> Result<usize, FatalAlert> {
        let credential = match self.credentials.lookup_by_key_id(identity) {
            Some(c) => c,
            None => {
                warn!(
                    "[{}] PSK requested for unknown identity '{}'",
                    peer,
                    String::from_utf8_lossy(identity)
                );
                return Err(FatalAlert(AlertDescription::HandshakeFailure));
            }
        };

        credential.write_key(out).map_err(|e| {
            error!("[{}] Cannot set PSK: {}", peer, e);
            FatalAlert(AlertDescription::InternalError)
        })
    }
}

impl ChannelHandler for ChannelAdapter<'_> {
    fn send(&mut self, peer: &PeerAddress, data: &[u8]) -> io::Result<usize> {
        match self.socket.try_send_to(data, peer.socket_addr()) {
            Ok(n) => {
                if n < data.len() {
                    warn!("[{}] Short send: {} of {} bytes", peer, n, data.len());
                }
                trace!("[{}] Sent {} bytes", peer, n);
                self.report.datagrams_sent += 1;
                self.report.bytes_sent += n;
                DATAGRAMS_SENT.inc();
                BYTES_SENT.inc_by(n as u64);
                Ok(n)
            }
            Err(e) => {
                if e.kind() == ErrorKind::WouldBlock {
                    debug!("[{}] Send would block, dropped {} bytes", peer, data.len());
                } else {
                    warn!("[{}] Send failed: {}", peer, e);
                }
                self.report.send_failures += 1;
                SEND_FAILURES.inc();
                Err(e)
            }
        }
    }

    fn deliver(&mut self, peer: &PeerAddress, data: &[u8]) {
        trace!("[{}] Plaintext {} bytes -> {}", peer, data.len(), self.backend.name());
        self.report.payloads_delivered += 1;
        self.report.bytes_delivered += data.len();
        PLAINTEXT_BYTES_DELIVERED.inc_by(data.len() as u64);

        if let Err(e) = self.backend.forward(peer, data) {
            debug!("[{}] Backend dropped plaintext: {}", peer, e);
            self.report.backend_failures += 1;
            BACKEND_FAILURES.inc();
        }
    }

    fn event(&mut self, peer: &PeerAddress, event: ChannelEvent) {
        match event {
            ChannelEvent::ConnectStart => debug!("[{}] Handshake started", peer),
            ChannelEvent::RenegotiateStart => debug!("[{}] Renegotiation started", peer),
            ChannelEvent::Connected => {
                info!("[{}] Secure session established", peer);
                HANDSHAKES_COMPLETED.inc();
            }
            ChannelEvent::Alert { level, description } => {
                let label = description.to_string();
                ALERTS_TOTAL
                    .with_label_values(&[level.as_str(), label.as_str()])
                    .inc();
                if event.is_fatal() {
                    info!("[{}] Fatal alert {}, closing session", peer, description);
                    if self.report.eviction_for(peer).is_none() {
                        self.report.evictions.push((*peer, description));
                    }
                } else {
                    debug!("[{}] Warning alert {}", peer, description);
                }
            }
        }
        self.report.events.push(event);
    }

    fn resolve_credential(
        &mut self,
        peer: &PeerAddress,
        request: CredentialRequest<'_>,
        out: &mut [u8],
    ) -> Result<usize, FatalAlert> {
        let result = match request {
            // Responder side: no identity hint is offered
            CredentialRequest::Hint => Ok(0),
            CredentialRequest::Identity(claimed) => self.resolve_identity(peer, claimed, out),
            CredentialRequest::Key(identity) => self.resolve_key(peer, identity, out),
        };

        let outcome = match &result {
            Ok(_) => "found",
            Err(FatalAlert(AlertDescription::InternalError)) => "buffer_too_small",
            Err(_) => "not_found",
        };
        CREDENTIAL_LOOKUPS
            .with_label_values(&[request.phase(), outcome])
            .inc();

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Result;
    use crate::credential::Credential;
    use crate::engine::AlertLevel;

    /// Backend that keeps every payload
    #[derive(Default)]
    struct RecordingBackend {
        payloads: Vec<Vec<u8>>,
    }

    impl Backend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn forward(&mut self, _peer: &PeerAddress, payload: &[u8]) -> Result<()> {
            self.payloads.push(payload.to_vec());
            Ok(())
        }
    }

    /// Backend whose every forward fails
    struct RefusingBackend;

    impl Backend for RefusingBackend {
        fn name(&self) -> &'static str {
            "refusing"
        }

        fn forward(&mut self, _peer: &PeerAddress, _payload: &[u8]) -> Result<()> {
            Err(crate::error::Error::Backend("backend unavailable".into()))
        }
    }

    fn store() -> CredentialStore {
        let mut store = CredentialStore::new();
        store.insert(Credential::new("alice", "k1").unwrap());
        store.insert(Credential::new("a-rather-long-identity", "k2").unwrap());
        store
    }

    fn peer() -> PeerAddress {
        "127.0.0.1:45000".parse::<std::net::SocketAddr>().unwrap().into()
    }

    #[tokio::test]
    async fn test_hint_phase_returns_empty() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let credentials = store();
        let mut backend = RecordingBackend::default();
        let mut adapter = ChannelAdapter::new(&socket, &credentials, &mut backend);

        let mut out = [0xAAu8; 16];
        let n = adapter
            .resolve_credential(&peer(), CredentialRequest::Hint, &mut out)
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(out, [0xAAu8; 16]);
    }

    #[tokio::test]
    async fn test_identity_phase() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let credentials = store();
        let mut backend = RecordingBackend::default();
        let mut adapter = ChannelAdapter::new(&socket, &credentials, &mut backend);

        let mut out = [0u8; 32];
        let n = adapter
            .resolve_credential(&peer(), CredentialRequest::Identity(b"alice"), &mut out)
            .unwrap();
        assert_eq!(&out[..n], b"alice");

        let err = adapter
            .resolve_credential(&peer(), CredentialRequest::Identity(b"bob"), &mut out)
            .unwrap_err();
        assert_eq!(err, FatalAlert(AlertDescription::CloseNotify));
    }

    #[tokio::test]
    async fn test_identity_buffer_too_small_writes_nothing() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let credentials = store();
        let mut backend = RecordingBackend::default();
        let mut adapter = ChannelAdapter::new(&socket, &credentials, &mut backend);

        let mut out = [0u8; 8];
        let err = adapter
            .resolve_credential(
                &peer(),
                CredentialRequest::Identity(b"a-rather-long-identity"),
                &mut out,
            )
            .unwrap_err();
        assert_eq!(err, FatalAlert(AlertDescription::InternalError));
        assert_eq!(out, [0u8; 8]);
    }

    #[tokio::test]
    async fn test_key_phase() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let credentials = store();
        let mut backend = RecordingBackend::default();
        let mut adapter = ChannelAdapter::new(&socket, &credentials, &mut backend);

        let mut out = [0u8; 32];
        let n = adapter
            .resolve_credential(&peer(), CredentialRequest::Key(b"alice"), &mut out)
            .unwrap();
        assert_eq!(&out[..n], b"k1");

        let mut tiny = [0u8; 1];
        let err = adapter
            .resolve_credential(&peer(), CredentialRequest::Key(b"alice"), &mut tiny)
            .unwrap_err();
        assert_eq!(err, FatalAlert(AlertDescription::InternalError));
    }

    #[tokio::test]
    async fn test_unknown_key_is_handshake_failure_not_close_notify() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let credentials = store();
        let mut backend = RecordingBackend::default();
        let mut adapter = ChannelAdapter::new(&socket, &credentials, &mut backend);

        let mut out = [0u8; 32];
        let err = adapter
            .resolve_credential(&peer(), CredentialRequest::Key(b"never-inserted"), &mut out)
            .unwrap_err();
        assert_eq!(err.description(), AlertDescription::HandshakeFailure);
        assert_ne!(err.description(), AlertDescription::CloseNotify);
    }

    #[tokio::test]
    async fn test_fatal_alert_marks_eviction_once() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let credentials = store();
        let mut backend = RecordingBackend::default();
        let mut adapter = ChannelAdapter::new(&socket, &credentials, &mut backend);

        adapter.event(&peer(), ChannelEvent::ConnectStart);
        adapter.event(
            &peer(),
            ChannelEvent::Alert {
                level: AlertLevel::Warning,
                description: AlertDescription::CloseNotify,
            },
        );
        let fatal = ChannelEvent::Alert {
            level: AlertLevel::Fatal,
            description: AlertDescription::BadRecordMac,
        };
        adapter.event(&peer(), fatal);
        adapter.event(&peer(), fatal);

        let report = adapter.finish();
        assert_eq!(report.events.len(), 4);
        assert_eq!(report.evictions, vec![(peer(), AlertDescription::BadRecordMac)]);
    }

    #[tokio::test]
    async fn test_send_and_deliver() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = PeerAddress::from(receiver.local_addr().unwrap());
        let credentials = store();
        let mut backend = RecordingBackend::default();

        let report = {
            let mut adapter = ChannelAdapter::new(&socket, &credentials, &mut backend);
            assert_eq!(adapter.send(&target, b"cipher").unwrap(), 6);
            adapter.deliver(&target, b"plain");
            adapter.finish()
        };

        assert_eq!(report.datagrams_sent, 1);
        assert_eq!(report.bytes_sent, 6);
        assert_eq!(report.bytes_delivered, 5);
        assert_eq!(backend.payloads, vec![b"plain".to_vec()]);

        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"cipher");
    }

    #[tokio::test]
    async fn test_backend_failure_is_counted_not_fatal() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let credentials = store();
        let mut backend = RefusingBackend;
        let mut adapter = ChannelAdapter::new(&socket, &credentials, &mut backend);

        adapter.deliver(&peer(), b"plain");
        adapter.deliver(&peer(), b"more");
        let report = adapter.finish();

        assert_eq!(report.payloads_delivered, 2);
        assert_eq!(report.bytes_delivered, 9);
        assert_eq!(report.backend_failures, 2);
        assert!(report.evictions.is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_is_reported() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let credentials = store();
        let mut backend = RecordingBackend::default();
        let mut adapter = ChannelAdapter::new(&socket, &credentials, &mut backend);

        // an IPv6 destination is unreachable from an IPv4 socket
        let v6_peer = PeerAddress::from("[::1]:9".parse::<std::net::SocketAddr>().unwrap());
        assert!(adapter.send(&v6_peer, b"cipher").is_err());
        let report = adapter.finish();

        assert_eq!(report.send_failures, 1);
        assert_eq!(report.datagrams_sent, 0);
        assert_eq!(report.bytes_sent, 0);
        assert!(report.evictions.is_empty());
    }
}
