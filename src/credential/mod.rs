//! Credential Store
//!
//! Responsibilities:
//! - Hold PSK identity/key pairs for the lifetime of the proxy
//! - Answer identity lookups (peer declared an identity)
//! - Answer key-id lookups (engine wants the secret for an accepted identity)
//!
//! Identity and key-id share one namespace: there is exactly one credential
//! per identity. A miss is `None`, never an error; turning a miss into a
//! protocol alert is the adapter's job.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, warn};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Maximum PSK identity length in bytes
pub const MAX_IDENTITY_LEN: usize = 128;

/// Maximum PSK key length in bytes
pub const MAX_KEY_LEN: usize = 64;

// ============================================================================
// Credential
// ============================================================================

/// Output buffer provided by the engine cannot hold the credential field
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("buffer too small: need {needed} bytes, have {available}")]
pub struct BufferTooSmall {
    pub needed: usize,
    pub available: usize,
}

/// Pre-shared key credential
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    identity: Vec<u8>,
    key: Vec<u8>,
}

impl Credential {
    /// Build a credential, validating field lengths
    pub fn new(identity: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Result<Self> {
        let identity = identity.into();
        let key = key.into();

        if identity.is_empty() {
            return Err(Error::Credential("PSK identity must not be empty".into()));
        }
        if identity.len() > MAX_IDENTITY_LEN {
            return Err(Error::Credential(format!(
                "PSK identity is {} bytes (max {})",
                identity.len(),
                MAX_IDENTITY_LEN
            )));
        }
        if key.is_empty() {
            return Err(Error::Credential("PSK key must not be empty".into()));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(Error::Credential(format!(
                "PSK key is {} bytes (max {})",
                key.len(),
                MAX_KEY_LEN
            )));
        }

        Ok(Self { identity, key })
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Identity rendered for logs
    pub fn identity_lossy(&self) -> String {
        String::from_utf8_lossy(&self.identity).into_owned()
    }

    /// Copy the identity into `out`. Nothing is written on failure.
    pub fn write_identity(&self, out: &mut [u8]) -> std::result::Result<usize, BufferTooSmall> {
        copy_exact(&self.identity, out)
    }

    /// Copy the key into `out`. Nothing is written on failure.
    pub fn write_key(&self, out: &mut [u8]) -> std::result::Result<usize, BufferTooSmall> {
        copy_exact(&self.key, out)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity_lossy())
            .field("key", &format_args!("<{} bytes>", self.key.len()))
            .finish()
    }
}

fn copy_exact(src: &[u8], out: &mut [u8]) -> std::result::Result<usize, BufferTooSmall> {
    if out.len() < src.len() {
        return Err(BufferTooSmall {
            needed: src.len(),
            available: out.len(),
        });
    }
    out[..src.len()].copy_from_slice(src);
    Ok(src.len())
}

// ============================================================================
// Credential Store
// ============================================================================

/// Identity-keyed credential store
#[derive(Debug, Default)]
pub struct CredentialStore {
    items: HashMap<Vec<u8>, Credential>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a credential. The last insert for an identity wins; the
    /// replaced credential is returned.
    pub fn insert(&mut self, credential: Credential) -> Option<Credential> {
        let identity = credential.identity().to_vec();
        let previous = self.items.insert(identity, credential);
        match &previous {
            Some(old) => warn!(
                "Credential store: replaced PSK for identity '{}'",
                old.identity_lossy()
            ),
            None => debug!("Credential store: {} credential(s)", self.items.len()),
        }
        previous
    }

    /// Credential whose identity equals the identity the peer declared
    pub fn lookup_by_identity(&self, identity: &[u8]) -> Option<&Credential> {
        self.items.get(identity)
    }

    /// Credential holding the secret for an identity the engine already accepted
    pub fn lookup_by_key_id(&self, key_id: &[u8]) -> Option<&Credential> {
        self.items.get(key_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn identities(&self) -> impl Iterator<Item = &[u8]> {
        self.items.keys().map(|k| k.as_slice())
    }
}
