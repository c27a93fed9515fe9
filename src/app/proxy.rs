//! Proxy Core
//!
//! Owns the listening socket, the engine context, the session table, the
//! credential store and the backend, and ties them together on the
//! dispatch path:
//!
//! ```text
//! readiness → on_readable() → try_recv_from → SessionTable find/create
//!           → engine.handle_message(ChannelAdapter) → evictions
//! ```
//!
//! Lifecycle: `init` → Bound → `run` → Running → stop → Stopped → `deinit`.
//! Everything runs on one task; there is no locking.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{Backend, BlackholeBackend, UdpBackend};
use crate::common::{PeerAddress, Result};
use crate::config::ProxyOptions;
use crate::credential::{Credential, CredentialStore};
use crate::engine::{AlertDescription, ChannelEngine, EngineError};
use crate::error::Error;
use crate::session::{SessionLimits, SessionTable};

use super::adapter::{ChannelAdapter, DispatchReport};
use super::metrics::{
    init_metrics, record_session_destroyed, BYTES_RECEIVED, DATAGRAMS_DROPPED,
    DATAGRAMS_RECEIVED, SESSIONS_ACTIVE, SESSIONS_CREATED, SESSIONS_DESTROYED,
};
use super::reactor::{Reactor, Readiness, ShutdownHandle};

// ============================================================================
// Constants
// ============================================================================

/// Receive buffer size; large enough for any UDP payload
const RECV_BUFFER_SIZE: usize = 65535;

// ============================================================================
// State and outcomes
// ============================================================================

/// Proxy lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Bound,
    Running,
    Stopped,
}

impl ProxyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyState::Bound => "bound",
            ProxyState::Running => "running",
            ProxyState::Stopped => "stopped",
        }
    }
}

/// Why a datagram never reached the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Admission limit reached
    SessionLimit,
    /// Engine could not allocate session state
    Allocation,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::SessionLimit => "session_limit",
            DropReason::Allocation => "allocation",
        }
    }
}

/// Result of handling one readiness notification
#[derive(Debug)]
pub enum Dispatch {
    /// Nothing was pending, or the read failed transiently
    Idle,
    /// Datagram dropped before reaching the engine; no session persists
    Dropped { peer: PeerAddress, reason: DropReason },
    /// Engine processed the datagram; the session lives on
    Handled {
        peer: PeerAddress,
        created: bool,
        report: DispatchReport,
    },
    /// Engine failed or raised a fatal alert; the session was destroyed
    Closed {
        peer: PeerAddress,
        created: bool,
        error: Option<EngineError>,
        alert: Option<AlertDescription>,
        report: DispatchReport,
    },
}

impl Dispatch {
    pub fn peer(&self) -> Option<&PeerAddress> {
        match self {
            Dispatch::Idle => None,
            Dispatch::Dropped { peer, .. }
            | Dispatch::Handled { peer, .. }
            | Dispatch::Closed { peer, .. } => Some(peer),
        }
    }

    pub fn report(&self) -> Option<&DispatchReport> {
        match self {
            Dispatch::Handled { report, .. } | Dispatch::Closed { report, .. } => Some(report),
            _ => None,
        }
    }
}

// ============================================================================
// Proxy
// ============================================================================

/// UDP secure-session proxy
pub struct Proxy<E: ChannelEngine> {
    state: ProxyState,
    local_addr: SocketAddr,
    engine: E,
    sessions: SessionTable,
    credentials: CredentialStore,
    backend: Box<dyn Backend>,
    socket: Arc<UdpSocket>,
    shutdown: ShutdownHandle,
    recv_buf: Vec<u8>,
    released: bool,
}

impl<E: ChannelEngine + Default> Proxy<E> {
    /// Initialize with a default-constructed engine context
    pub fn init(options: &ProxyOptions, credential: Credential) -> Result<Self> {
        Self::init_with(options, credential, || Ok(E::default()))
    }
}

impl<E: ChannelEngine> Proxy<E> {
    /// Resolve and bind the listening socket, create the engine context
    /// with `new_context`, and install `credential`.
    ///
    /// Must be called from within a tokio runtime. On failure every
    /// resource created so far is released before returning.
    pub fn init_with<F>(
        options: &ProxyOptions,
        credential: Credential,
        new_context: F,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<E>,
    {
        init_metrics();

        debug!("listen = {}:{}", options.listen_host, options.listen_port);
        if let Some(backend) = &options.backend {
            debug!("backend = {}:{}", backend.host, backend.port);
        }
        debug!("psk identity = '{}'", credential.identity_lossy());

        let listen_addr = resolve_address(&options.listen_host, options.listen_port)?;
        let socket = bind_listen_socket(listen_addr)?;
        let local_addr = socket.local_addr()?;

        let mut engine = new_context()?;

        let mut credentials = CredentialStore::new();
        credentials.insert(credential);

        let backend = match build_backend(options) {
            Ok(b) => b,
            Err(e) => {
                engine.free_context();
                return Err(e);
            }
        };

        let limits = SessionLimits {
            max_sessions: options.max_sessions,
        };

        info!(
            "Bound udp://{} (engine: {}, backend: {})",
            local_addr,
            engine.name(),
            backend.name()
        );

        Ok(Self {
            state: ProxyState::Bound,
            local_addr,
            engine,
            sessions: SessionTable::new(limits),
            credentials,
            backend,
            socket: Arc::new(socket),
            shutdown: ShutdownHandle::new(),
            recv_buf: vec![0u8; RECV_BUFFER_SIZE],
            released: false,
        })
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Add another PSK; returns the credential it replaced, if any
    pub fn add_credential(&mut self, credential: Credential) -> Option<Credential> {
        self.credentials.insert(credential)
    }

    /// Swap the plaintext sink; returns the previous one
    pub fn replace_backend(&mut self, backend: Box<dyn Backend>) -> Box<dyn Backend> {
        info!("Backend: {} -> {}", self.backend.name(), backend.name());
        std::mem::replace(&mut self.backend, backend)
    }

    /// Handle that stops `run` from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Request the reactor loop to stop
    pub fn stop(&self) {
        self.shutdown.stop();
    }

    /// Serve datagrams until stopped
    pub async fn run(&mut self) -> Result<()> {
        if self.state != ProxyState::Bound {
            return Err(Error::InvalidState {
                expected: ProxyState::Bound.as_str(),
                actual: self.state.as_str(),
            });
        }
        self.state = ProxyState::Running;
        info!("Listening on udp://{}", self.local_addr);

        let mut reactor = Reactor::register(self.socket.clone(), &self.shutdown);
        let result = loop {
            match reactor.wait().await {
                Readiness::Readable => {
                    let dispatch = self.on_readable();
                    trace!("Dispatch outcome: {:?}", dispatch);
                }
                Readiness::Shutdown => break Ok(()),
                Readiness::Failed(e) => {
                    error!("Reactor error on udp://{}: {}", self.local_addr, e);
                    reactor.deregister();
                    break Err(Error::Io(e));
                }
            }
        };

        self.state = ProxyState::Stopped;
        info!(
            "Stopped udp://{} ({} notifications, {} live sessions)",
            self.local_addr,
            reactor.notifications(),
            self.sessions.len()
        );
        result
    }

    /// Wait for readiness, then handle one datagram
    pub async fn dispatch_next(&mut self) -> Result<Dispatch> {
        self.socket.readable().await?;
        Ok(self.on_readable())
    }

    /// Read exactly one datagram, if any is pending, and dispatch it
    pub fn on_readable(&mut self) -> Dispatch {
        let (len, from) = match self.socket.try_recv_from(&mut self.recv_buf) {
            Ok(received) => received,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                trace!("Spurious readiness on udp://{}", self.local_addr);
                return Dispatch::Idle;
            }
            Err(e) => {
                warn!("recvfrom on udp://{}: {}", self.local_addr, e);
                return Dispatch::Idle;
            }
        };

        let peer = PeerAddress::from(from);
        DATAGRAMS_RECEIVED.inc();
        BYTES_RECEIVED.inc_by(len as u64);
        trace!("[{}] Got {} bytes", peer, len);

        self.dispatch_datagram(peer, len)
    }

    fn dispatch_datagram(&mut self, peer: PeerAddress, len: usize) -> Dispatch {
        let Self {
            engine,
            sessions,
            credentials,
            backend,
            socket,
            recv_buf,
            ..
        } = self;

        let existing = sessions.find(&peer).map(|s| s.handle());
        let (handle, created) = match existing {
            Some(handle) => (handle, false),
            None => match sessions.create(engine, socket.clone(), peer) {
                Ok(session) => {
                    SESSIONS_CREATED.inc();
                    SESSIONS_ACTIVE.inc();
                    (session.handle(), true)
                }
                Err(e) => {
                    let reason = match e {
                        Error::SessionLimit(_) => DropReason::SessionLimit,
                        _ => DropReason::Allocation,
                    };
                    warn!("[{}] Dropping datagram: {}", peer, e);
                    DATAGRAMS_DROPPED.with_label_values(&[reason.as_str()]).inc();
                    return Dispatch::Dropped { peer, reason };
                }
            },
        };
        sessions.touch(&peer);

        let mut adapter = ChannelAdapter::new(socket.as_ref(), credentials, backend.as_mut());
        let outcome = engine.handle_message(handle, &peer, &recv_buf[..len], &mut adapter);
        let report = adapter.finish();

        for (other, description) in &report.evictions {
            if *other != peer {
                debug!("[{}] Evicting after {}", other, description);
                if let Some(session) = sessions.destroy(engine, other) {
                    record_session_destroyed("fatal_alert", session.age());
                }
            }
        }

        let alert = report.eviction_for(&peer);
        let error = match (outcome, alert) {
            (Ok(()), None) => {
                return Dispatch::Handled {
                    peer,
                    created,
                    report,
                }
            }
            (outcome, _) => outcome.err(),
        };

        let reason = if error.is_some() {
            "engine_error"
        } else {
            "fatal_alert"
        };
        match (&error, created) {
            (Some(e), true) => debug!("[{}] First datagram rejected: {}", peer, e),
            (Some(e), false) => info!("[{}] Session failed: {}", peer, e),
            (None, _) => {}
        }
        if let Some(session) = sessions.destroy(engine, &peer) {
            record_session_destroyed(reason, session.age());
        }

        Dispatch::Closed {
            peer,
            created,
            error,
            alert,
            report,
        }
    }

    /// Destroy all sessions and free the engine context. Idempotent.
    fn release(&mut self) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;
        self.shutdown.stop();

        let destroyed = self.sessions.destroy_all(&mut self.engine);
        if destroyed > 0 {
            SESSIONS_ACTIVE.sub(destroyed as i64);
            SESSIONS_DESTROYED
                .with_label_values(&["shutdown"])
                .inc_by(destroyed as u64);
        }
        self.engine.free_context();
        destroyed
    }

    /// Tear down: sessions, engine context, credential store, backend,
    /// then the socket.
    pub fn deinit(mut self) {
        let destroyed = self.release();
        info!(
            "Shut down udp://{} ({} session(s) closed, {} credential(s) released)",
            self.local_addr,
            destroyed,
            self.credentials.len()
        );
    }
}

impl<E: ChannelEngine> Drop for Proxy<E> {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Socket setup
// ============================================================================

/// Resolve `host:port` to the first address returned
fn resolve_address(host: &str, port: u16) -> Result<SocketAddr> {
    if host.is_empty() {
        return Err(Error::Resolve("empty host".into()));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Resolve(format!("{}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| Error::Resolve(format!("{}:{}: no addresses", host, port)))
}

/// Non-blocking UDP socket with SO_REUSEADDR, dual-stack when IPv6
fn bind_listen_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| with_context("socket", e))?;

    if let Err(e) = socket.set_reuse_address(true) {
        warn!("setsockopt SO_REUSEADDR: {}", e);
    }
    if addr.is_ipv6() {
        if let Err(e) = socket.set_only_v6(false) {
            debug!("setsockopt IPV6_V6ONLY: {}", e);
        }
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| with_context("set_nonblocking", e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| with_context(&format!("bind {}", addr), e))?;

    Ok(UdpSocket::from_std(socket.into())?)
}

fn build_backend(options: &ProxyOptions) -> Result<Box<dyn Backend>> {
    match &options.backend {
        Some(backend) => {
            let target = resolve_address(&backend.host, backend.port)?;
            Ok(Box::new(UdpBackend::connect(target)?))
        }
        None => Ok(Box::new(BlackholeBackend::new())),
    }
}

fn with_context(what: &str, e: io::Error) -> Error {
    Error::Io(io::Error::new(e.kind(), format!("{}: {}", what, e)))
}
