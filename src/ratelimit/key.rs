//! Storage key generation.

use std::fmt;
use std::sync::Arc;

/// Maps a raw identifier (IP, user id, API key) to the key it is counted
/// under.
pub trait KeyGenerator: Send + Sync {
    fn generate_key(&self, identifier: &str) -> String;
}

/// Counts every identifier under itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityKey;

impl KeyGenerator for IdentityKey {
    fn generate_key(&self, identifier: &str) -> String {
        identifier.to_string()
    }
}

impl<F> KeyGenerator for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn generate_key(&self, identifier: &str) -> String {
        self(identifier)
    }
}

/// Joins a key's prefix and id.
pub const KEY_SEPARATOR: char = ':';

/// A namespaced storage key.
///
/// Limiters sharing one store are kept apart by giving each its own prefix.
/// Prefixes never contain [`KEY_SEPARATOR`], so the stored key splits back
/// into prefix and id at its first separator. A limiter without a prefix
/// shares the root namespace with every other unprefixed limiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Namespace of the owning limiter, possibly empty
    pub prefix: String,
    /// Output of the key generator
    pub id: String,
}

impl RateLimitKey {
    pub fn new(prefix: &str, id: String) -> Self {
        Self {
            prefix: prefix.to_string(),
            id,
        }
    }

    /// The key as stored in the backend.
    pub fn to_storage_key(&self) -> String {
        if self.prefix.is_empty() {
            self.id.clone()
        } else {
            format!("{}{}{}", self.prefix, KEY_SEPARATOR, self.id)
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}

/// Prefix plus generator, as held by a limiter.
#[derive(Clone)]
pub(crate) struct KeyBuilder {
    prefix: String,
    generator: Arc<dyn KeyGenerator>,
}

impl KeyBuilder {
    pub(crate) fn new(prefix: String, generator: Arc<dyn KeyGenerator>) -> Self {
        Self { prefix, generator }
    }

    pub(crate) fn key_for(&self, identifier: &str) -> RateLimitKey {
        RateLimitKey::new(&self.prefix, self.generator.generate_key(identifier))
    }
}

impl fmt::Debug for KeyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBuilder")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
