//! Session Table
//!
//! Responsibilities:
//! - Map each peer address to its secure session
//! - Allocate the engine's per-peer state on first contact
//! - Release that state exactly once on eviction or shutdown
//!
//! Sessions are keyed by the datagram source address: the first datagram of
//! a peer is pre-handshake and carries no other identity. The address is
//! therefore attacker-controlled; `SessionLimits` is the single place where
//! admission policy applies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::common::{PeerAddress, Result};
use crate::engine::{ChannelEngine, SessionHandle};
use crate::error::Error;

// ============================================================================
// Session
// ============================================================================

/// Per-peer secure session
pub struct Session {
    peer: PeerAddress,
    handle: SessionHandle,
    socket: Arc<UdpSocket>,
    created_at: Instant,
    last_seen: Instant,
    datagrams: u64,
}

impl Session {
    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Listening socket the session replies through
    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle(&self) -> Duration {
        self.last_seen.elapsed()
    }

    /// Inbound datagrams seen on this session
    pub fn datagrams(&self) -> u64 {
        self.datagrams
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("handle", &self.handle)
            .field("datagrams", &self.datagrams)
            .finish()
    }
}

// ============================================================================
// Admission
// ============================================================================

/// Admission limits applied on session creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionLimits {
    /// Maximum concurrent sessions (None = unlimited)
    pub max_sessions: Option<usize>,
}

impl SessionLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_max_sessions(max: usize) -> Self {
        Self {
            max_sessions: Some(max),
        }
    }

    fn admits(&self, current: usize) -> bool {
        self.max_sessions.map_or(true, |max| current < max)
    }
}

// ============================================================================
// Session Table
// ============================================================================

/// Address-keyed session table
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<PeerAddress, Session>,
    limits: SessionLimits,
}

impl SessionTable {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: HashMap::new(),
            limits,
        }
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Exact-match lookup
    pub fn find(&self, peer: &PeerAddress) -> Option<&Session> {
        self.sessions.get(peer)
    }

    pub fn contains(&self, peer: &PeerAddress) -> bool {
        self.sessions.contains_key(peer)
    }

    /// Allocate engine state for `peer` and insert a new session.
    ///
    /// Nothing is inserted when the engine refuses the allocation, when a
    /// session for `peer` already exists, or when the limit is reached.
    pub fn create<E>(
        &mut self,
        engine: &mut E,
        socket: Arc<UdpSocket>,
        peer: PeerAddress,
    ) -> Result<&Session>
    where
        E: ChannelEngine + ?Sized,
    {
        if self.sessions.contains_key(&peer) {
            return Err(Error::SessionExists(peer));
        }
        if !self.limits.admits(self.sessions.len()) {
            return Err(Error::SessionLimit(self.sessions.len()));
        }

        let handle = engine
            .new_session(&peer)
            .map_err(|e| Error::Engine(format!("new session for {}: {}", peer, e)))?;

        let now = Instant::now();
        let session = Session {
            peer,
            handle,
            socket,
            created_at: now,
            last_seen: now,
            datagrams: 0,
        };

        debug!(
            "Session {} created for {} ({} active)",
            handle,
            peer,
            self.sessions.len() + 1
        );
        Ok(self.sessions.entry(peer).or_insert(session))
    }

    /// Record an inbound datagram on `peer`'s session
    pub fn touch(&mut self, peer: &PeerAddress) {
        if let Some(session) = self.sessions.get_mut(peer) {
            session.last_seen = Instant::now();
            session.datagrams += 1;
        }
    }

    /// Remove `peer`'s session and free its engine state.
    ///
    /// Returns the removed session, or `None` if there was none; a second
    /// call for the same peer is a no-op.
    pub fn destroy<E>(&mut self, engine: &mut E, peer: &PeerAddress) -> Option<Session>
    where
        E: ChannelEngine + ?Sized,
    {
        let session = self.sessions.remove(peer)?;
        engine.free_session(session.handle);
        debug!(
            "Session {} destroyed for {} (age {:?}, idle {:?}, {} datagrams, {} active)",
            session.handle,
            peer,
            session.age(),
            session.idle(),
            session.datagrams,
            self.sessions.len()
        );
        Some(session)
    }

    /// Destroy every session. Returns how many were destroyed.
    pub fn destroy_all<E>(&mut self, engine: &mut E) -> usize
    where
        E: ChannelEngine + ?Sized,
    {
        let count = self.sessions.len();
        for (peer, session) in self.sessions.drain() {
            trace!("Session {} for {} released at shutdown", session.handle, peer);
            engine.free_session(session.handle);
        }
        if count > 0 {
            debug!("Destroyed {} session(s)", count);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerAddress> {
        self.sessions.keys()
    }
}
