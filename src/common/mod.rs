//! Common types and abstractions
//!
//! This module defines the core types used throughout the proxy:
//! - PeerAddress: the session key, one per remote UDP endpoint
//! - Error: unified error types

mod address;

pub use address::PeerAddress;

// Re-export error types from crate root
pub use crate::error::{Error, Result};
