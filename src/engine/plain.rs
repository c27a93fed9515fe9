//! Plain engine - unprotected records for development and testing
//!
//! Runs the responder side of a PSK-style handshake without any
//! cryptography, so the dispatch path can be exercised end to end.
//!
//! Record layout: one content-type byte followed by the payload.
//!
//! | type   | payload              | meaning                          |
//! |--------|----------------------|----------------------------------|
//! | `0x16` | claimed identity     | handshake; answered `0x16 ‖ id`  |
//! | `0x17` | application bytes    | delivered once connected         |
//! | `0x15` | `level, description` | alert from the peer              |

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::common::PeerAddress;
use crate::credential::{MAX_IDENTITY_LEN, MAX_KEY_LEN};

use super::{
    AlertDescription, AlertLevel, ChannelEngine, ChannelEvent, ChannelHandler, CredentialRequest,
    EngineError, FatalAlert, SessionHandle,
};

pub const CONTENT_ALERT: u8 = 0x15;
pub const CONTENT_HANDSHAKE: u8 = 0x16;
pub const CONTENT_APPLICATION_DATA: u8 = 0x17;

struct PlainSession {
    peer: PeerAddress,
    identity: Option<Vec<u8>>,
}

impl PlainSession {
    fn is_connected(&self) -> bool {
        self.identity.is_some()
    }
}

/// Engine without record protection
#[derive(Default)]
pub struct PlainEngine {
    sessions: HashMap<SessionHandle, PlainSession>,
    next_id: u64,
    freed: bool,
}

impl PlainEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocated session handles
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Identity accepted for `handle`, once its handshake completed
    pub fn identity(&self, handle: SessionHandle) -> Option<&[u8]> {
        self.sessions
            .get(&handle)
            .and_then(|s| s.identity.as_deref())
    }

    fn handshake(
        session: &mut PlainSession,
        peer: &PeerAddress,
        claimed: &[u8],
        handler: &mut dyn ChannelHandler,
    ) -> Result<(), EngineError> {
        if session.is_connected() {
            handler.event(peer, ChannelEvent::RenegotiateStart);
        } else {
            handler.event(peer, ChannelEvent::ConnectStart);
        }

        let mut hint = [0u8; MAX_IDENTITY_LEN];
        let hint_len = handler
            .resolve_credential(peer, CredentialRequest::Hint, &mut hint)
            .map_err(|alert| Self::abort(peer, alert, handler))?;
        trace!("PlainEngine: {} hint {} bytes", peer, hint_len);

        let mut identity = [0u8; MAX_IDENTITY_LEN];
        let identity_len = handler
            .resolve_credential(peer, CredentialRequest::Identity(claimed), &mut identity)
            .map_err(|alert| Self::abort(peer, alert, handler))?;
        let identity = &identity[..identity_len];

        let mut key = [0u8; MAX_KEY_LEN];
        let key_len = handler
            .resolve_credential(peer, CredentialRequest::Key(identity), &mut key)
            .map_err(|alert| Self::abort(peer, alert, handler))?;
        if key_len == 0 {
            return Err(Self::abort(
                peer,
                FatalAlert(AlertDescription::InternalError),
                handler,
            ));
        }

        let mut reply = Vec::with_capacity(1 + identity.len());
        reply.push(CONTENT_HANDSHAKE);
        reply.extend_from_slice(identity);
        if let Err(e) = handler.send(peer, &reply) {
            debug!("PlainEngine: handshake reply to {} failed: {}", peer, e);
        }

        session.identity = Some(identity.to_vec());
        handler.event(peer, ChannelEvent::Connected);
        Ok(())
    }

    /// Tell the peer why the handshake stopped
    fn abort(
        peer: &PeerAddress,
        alert: FatalAlert,
        handler: &mut dyn ChannelHandler,
    ) -> EngineError {
        let record = [CONTENT_ALERT, AlertLevel::Fatal.code(), alert.0.code()];
        if let Err(e) = handler.send(peer, &record) {
            debug!("PlainEngine: alert to {} failed: {}", peer, e);
        }
        handler.event(
            peer,
            ChannelEvent::Alert {
                level: AlertLevel::Fatal,
                description: alert.0,
            },
        );
        EngineError::Alert(alert.0)
    }

    fn alert(
        session: &mut PlainSession,
        peer: &PeerAddress,
        payload: &[u8],
        handler: &mut dyn ChannelHandler,
    ) -> Result<(), EngineError> {
        let (level, description) = match payload {
            [level, description] => (
                AlertLevel::from_code(*level)
                    .ok_or_else(|| EngineError::Malformed(format!("alert level {}", level)))?,
                AlertDescription::from_code(*description),
            ),
            _ => return Err(EngineError::Malformed("alert record must be 2 bytes".into())),
        };

        if level == AlertLevel::Fatal || description == AlertDescription::CloseNotify {
            session.identity = None;
        }
        handler.event(peer, ChannelEvent::Alert { level, description });
        Ok(())
    }
}

impl ChannelEngine for PlainEngine {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn new_session(&mut self, peer: &PeerAddress) -> Result<SessionHandle, EngineError> {
        if self.freed {
            return Err(EngineError::Allocation("context already freed".into()));
        }
        self.next_id += 1;
        let handle = SessionHandle::new(self.next_id);
        self.sessions.insert(
            handle,
            PlainSession {
                peer: *peer,
                identity: None,
            },
        );
        Ok(handle)
    }

    fn free_session(&mut self, handle: SessionHandle) {
        if let Some(session) = self.sessions.remove(&handle) {
            trace!("PlainEngine: freed {} ({})", handle, session.peer);
        }
    }

    fn handle_message(
        &mut self,
        handle: SessionHandle,
        peer: &PeerAddress,
        datagram: &[u8],
        handler: &mut dyn ChannelHandler,
    ) -> Result<(), EngineError> {
        let session = self
            .sessions
            .get_mut(&handle)
            .ok_or(EngineError::UnknownSession(handle))?;

        let (&content_type, payload) = datagram
            .split_first()
            .ok_or_else(|| EngineError::Malformed("empty datagram".into()))?;

        match content_type {
            CONTENT_HANDSHAKE => Self::handshake(session, peer, payload, handler),
            CONTENT_APPLICATION_DATA => {
                if !session.is_connected() {
                    return Err(EngineError::UnexpectedMessage(
                        "application data before handshake".into(),
                    ));
                }
                handler.deliver(peer, payload);
                Ok(())
            }
            CONTENT_ALERT => Self::alert(session, peer, payload, handler),
            other => Err(EngineError::Malformed(format!(
                "unknown content type 0x{:02x}",
                other
            ))),
        }
    }

    fn free_context(&mut self) {
        if !self.sessions.is_empty() {
            debug!(
                "PlainEngine: releasing {} leftover session(s)",
                self.sessions.len()
            );
            self.sessions.clear();
        }
        self.freed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Handler that accepts one fixed PSK and records everything
    #[derive(Default)]
    struct RecordingHandler {
        sent: Vec<Vec<u8>>,
        delivered: Vec<Vec<u8>>,
        events: Vec<ChannelEvent>,
    }

    impl ChannelHandler for RecordingHandler {
        fn send(&mut self, _peer: &PeerAddress, data: &[u8]) -> io::Result<usize> {
            self.sent.push(data.to_vec());
            Ok(data.len())
        }

        fn deliver(&mut self, _peer: &PeerAddress, data: &[u8]) {
            self.delivered.push(data.to_vec());
        }

        fn event(&mut self, _peer: &PeerAddress, event: ChannelEvent) {
            self.events.push(event);
        }

        fn resolve_credential(
            &mut self,
            _peer: &PeerAddress,
            request: CredentialRequest<'_>,
            out: &mut [u8],
        ) -> Result<usize, FatalAlert> {
            match request {
                CredentialRequest::Hint => Ok(0),
                CredentialRequest::Identity(b"alice") | CredentialRequest::Key(b"alice") => {
                    let value: &[u8] = if matches!(request, CredentialRequest::Key(_)) {
                        b"k1"
                    } else {
                        b"alice"
                    };
                    out[..value.len()].copy_from_slice(value);
                    Ok(value.len())
                }
                CredentialRequest::Identity(_) => {
                    Err(FatalAlert(AlertDescription::CloseNotify))
                }
                CredentialRequest::Key(_) => Err(FatalAlert(AlertDescription::HandshakeFailure)),
            }
        }
    }

    fn peer() -> PeerAddress {
        "127.0.0.1:40000".parse::<std::net::SocketAddr>().unwrap().into()
    }

    #[test]
    fn test_handshake_then_data() {
        let mut engine = PlainEngine::new();
        let mut handler = RecordingHandler::default();
        let handle = engine.new_session(&peer()).unwrap();

        engine
            .handle_message(handle, &peer(), b"\x16alice", &mut handler)
            .unwrap();
        assert_eq!(
            handler.events,
            vec![ChannelEvent::ConnectStart, ChannelEvent::Connected]
        );
        assert_eq!(handler.sent, vec![b"\x16alice".to_vec()]);
        assert_eq!(engine.identity(handle), Some(&b"alice"[..]));

        engine
            .handle_message(handle, &peer(), b"\x17hello", &mut handler)
            .unwrap();
        assert_eq!(handler.delivered, vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_unknown_identity_aborts() {
        let mut engine = PlainEngine::new();
        let mut handler = RecordingHandler::default();
        let handle = engine.new_session(&peer()).unwrap();

        let err = engine
            .handle_message(handle, &peer(), b"\x16mallory", &mut handler)
            .unwrap_err();
        assert_eq!(err, EngineError::Alert(AlertDescription::CloseNotify));
        assert_eq!(handler.sent, vec![vec![CONTENT_ALERT, 2, 0]]);
        assert!(handler.events.last().unwrap().is_fatal());
    }

    #[test]
    fn test_data_before_handshake_rejected() {
        let mut engine = PlainEngine::new();
        let mut handler = RecordingHandler::default();
        let handle = engine.new_session(&peer()).unwrap();

        let err = engine
            .handle_message(handle, &peer(), b"\x17early", &mut handler)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnexpectedMessage(_)));
        assert!(handler.delivered.is_empty());
    }

    #[test]
    fn test_malformed_records() {
        let mut engine = PlainEngine::new();
        let mut handler = RecordingHandler::default();
        let handle = engine.new_session(&peer()).unwrap();

        assert!(matches!(
            engine.handle_message(handle, &peer(), b"", &mut handler),
            Err(EngineError::Malformed(_))
        ));
        assert!(matches!(
            engine.handle_message(handle, &peer(), b"\x99", &mut handler),
            Err(EngineError::Malformed(_))
        ));
        assert!(matches!(
            engine.handle_message(handle, &peer(), b"\x15\x02", &mut handler),
            Err(EngineError::Malformed(_))
        ));
    }

    #[test]
    fn test_free_session_and_context() {
        let mut engine = PlainEngine::new();
        let handle = engine.new_session(&peer()).unwrap();
        assert_eq!(engine.active_sessions(), 1);

        engine.free_session(handle);
        engine.free_session(handle);
        assert_eq!(engine.active_sessions(), 0);

        engine.free_context();
        assert!(engine.new_session(&peer()).is_err());
    }
}
