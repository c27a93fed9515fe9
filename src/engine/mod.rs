//! Secure-Channel Engine Boundary
//!
//! The handshake state machine and record protection live outside this
//! crate. The proxy talks to an engine only through two traits:
//!
//! ```text
//! Proxy ──ChannelEngine──▶ engine          (new/free session, handle message)
//! Proxy ◀─ChannelHandler── engine          (send, deliver, event, credential)
//! ```
//!
//! The handler is passed explicitly on every `handle_message` call, so the
//! engine never holds a reference into proxy state between datagrams.

mod plain;

#[cfg(test)]
pub(crate) mod testing;

pub use plain::PlainEngine;

use std::fmt;
use std::io;

use thiserror::Error;

use crate::common::PeerAddress;

// ============================================================================
// Handles
// ============================================================================

/// Opaque reference to the engine's per-peer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// Alerts and events
// ============================================================================

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertLevel {
    Warning,
    Fatal,
}

impl AlertLevel {
    pub fn code(&self) -> u8 {
        match self {
            AlertLevel::Warning => 1,
            AlertLevel::Fatal => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(AlertLevel::Warning),
            2 => Some(AlertLevel::Fatal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Warning => "warning",
            AlertLevel::Fatal => "fatal",
        }
    }
}

/// Alert description, wire codes as in (D)TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertDescription {
    CloseNotify,
    UnexpectedMessage,
    BadRecordMac,
    HandshakeFailure,
    DecodeError,
    DecryptError,
    InternalError,
    UnknownPskIdentity,
    Other(u8),
}

impl AlertDescription {
    pub fn code(&self) -> u8 {
        match self {
            AlertDescription::CloseNotify => 0,
            AlertDescription::UnexpectedMessage => 10,
            AlertDescription::BadRecordMac => 20,
            AlertDescription::HandshakeFailure => 40,
            AlertDescription::DecodeError => 50,
            AlertDescription::DecryptError => 51,
            AlertDescription::InternalError => 80,
            AlertDescription::UnknownPskIdentity => 115,
            AlertDescription::Other(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => AlertDescription::CloseNotify,
            10 => AlertDescription::UnexpectedMessage,
            20 => AlertDescription::BadRecordMac,
            40 => AlertDescription::HandshakeFailure,
            50 => AlertDescription::DecodeError,
            51 => AlertDescription::DecryptError,
            80 => AlertDescription::InternalError,
            115 => AlertDescription::UnknownPskIdentity,
            other => AlertDescription::Other(other),
        }
    }
}

impl fmt::Display for AlertDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertDescription::CloseNotify => write!(f, "close_notify"),
            AlertDescription::UnexpectedMessage => write!(f, "unexpected_message"),
            AlertDescription::BadRecordMac => write!(f, "bad_record_mac"),
            AlertDescription::HandshakeFailure => write!(f, "handshake_failure"),
            AlertDescription::DecodeError => write!(f, "decode_error"),
            AlertDescription::DecryptError => write!(f, "decrypt_error"),
            AlertDescription::InternalError => write!(f, "internal_error"),
            AlertDescription::UnknownPskIdentity => write!(f, "unknown_psk_identity"),
            AlertDescription::Other(code) => write!(f, "alert({})", code),
        }
    }
}

/// Fatal outcome of a credential callback. The engine aborts the handshake
/// and sends the peer an alert with this description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("fatal alert: {0}")]
pub struct FatalAlert(pub AlertDescription);

impl FatalAlert {
    pub fn description(&self) -> AlertDescription {
        self.0
    }
}

/// Notification raised by the engine while processing a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Handshake started
    ConnectStart,
    /// Handshake completed, application data may flow
    Connected,
    /// Peer started a new handshake on an established session
    RenegotiateStart,
    /// Alert sent or received
    Alert {
        level: AlertLevel,
        description: AlertDescription,
    },
}

impl ChannelEvent {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChannelEvent::Alert {
                level: AlertLevel::Fatal,
                ..
            }
        )
    }
}

impl fmt::Display for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelEvent::ConnectStart => write!(f, "connect-start"),
            ChannelEvent::Connected => write!(f, "connected"),
            ChannelEvent::RenegotiateStart => write!(f, "renegotiate-start"),
            ChannelEvent::Alert { level, description } => {
                write!(f, "{} alert {}", level.as_str(), description)
            }
        }
    }
}

/// Credential phase the engine is asking about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialRequest<'a> {
    /// Identity hint to offer the client
    Hint,
    /// Identity claimed by the peer
    Identity(&'a [u8]),
    /// Key for an identity the engine already accepted
    Key(&'a [u8]),
}

impl CredentialRequest<'_> {
    pub fn phase(&self) -> &'static str {
        match self {
            CredentialRequest::Hint => "hint",
            CredentialRequest::Identity(_) => "identity",
            CredentialRequest::Key(_) => "key",
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failure reported by the engine for one session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("handshake aborted with {0}")]
    Alert(AlertDescription),

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("cannot allocate session state: {0}")]
    Allocation(String),

    #[error("unknown session {0}")]
    UnknownSession(SessionHandle),
}

// ============================================================================
// Traits
// ============================================================================

/// Callbacks the engine invokes while it processes one datagram.
///
/// Implemented once, by the proxy's channel adapter.
pub trait ChannelHandler {
    /// Transmit ciphertext to `peer`. Best effort.
    fn send(&mut self, peer: &PeerAddress, data: &[u8]) -> io::Result<usize>;

    /// Decrypted application data from `peer`
    fn deliver(&mut self, peer: &PeerAddress, data: &[u8]);

    /// Handshake progress or alert for `peer`
    fn event(&mut self, peer: &PeerAddress, event: ChannelEvent);

    /// Fill `out` with the requested credential field, returning its length.
    /// `Err` carries the alert the engine must abort with.
    fn resolve_credential(
        &mut self,
        peer: &PeerAddress,
        request: CredentialRequest<'_>,
        out: &mut [u8],
    ) -> Result<usize, FatalAlert>;
}

/// Secure-channel engine context.
///
/// One context serves every session on the listening socket. Creating the
/// context is left to the caller of `Proxy::init_with`.
pub trait ChannelEngine {
    /// Engine name, for logs
    fn name(&self) -> &'static str;

    /// Allocate per-peer state
    fn new_session(&mut self, peer: &PeerAddress) -> Result<SessionHandle, EngineError>;

    /// Release per-peer state. Called exactly once per allocated handle.
    fn free_session(&mut self, handle: SessionHandle);

    /// Feed one inbound datagram for `handle`
    fn handle_message(
        &mut self,
        handle: SessionHandle,
        peer: &PeerAddress,
        datagram: &[u8],
        handler: &mut dyn ChannelHandler,
    ) -> Result<(), EngineError>;

    /// Release the context. No session handles are live when this is called.
    fn free_context(&mut self);
}
