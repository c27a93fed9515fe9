//! Sealgate - a UDP secure-session proxy
//!
//! # Architecture
//!
//! ```text
//! UDP socket (reactor readiness)
//! → Proxy::on_readable (one datagram)
//! → SessionTable (peer address → engine session)
//! → ChannelEngine::handle_message
//!     ↔ ChannelAdapter (send / deliver / event / resolve_credential)
//! → Backend (plaintext)
//! ```
//!
//! ## Core Principles
//!
//! - Exactly one engine session per remote address
//! - The engine never touches sockets; all I/O goes through the adapter
//! - Credentials are looked up by identity, never iterated
//! - Single task, no locks
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # PeerAddress
//! ├── credential/      # PSK credentials and their store
//! ├── engine/          # Secure-channel engine boundary + PlainEngine
//! ├── session/         # Session table
//! ├── backend/         # Plaintext sinks: UDP forwarder, blackhole
//! └── app/             # Proxy, adapter, reactor, metrics
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod credential;
pub mod engine;
pub mod session;
pub mod backend;
pub mod app;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::PeerAddress;
pub use error::{Error, Result};
pub use config::{Config, ProxyOptions};

// Architecture re-exports
pub use app::{Dispatch, Proxy, ProxyState, ShutdownHandle};
pub use credential::{Credential, CredentialStore};
pub use engine::{ChannelEngine, ChannelHandler, PlainEngine};
pub use session::{Session, SessionTable};
