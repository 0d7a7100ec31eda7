//! Identity & channel directory.
//!
//! # Data Flow
//! ```text
//! resolve(identity_key)
//!     → cache hit?  → Arc<Identity>
//!     → store.rs (file or memory record store)
//!     → identity.rs (record → validated Identity)
//!     → cached, returned
//!
//! authenticate(identity, password) → password.rs (argon2 PHC verify)
//! resolve_channel(identity, key?)  → explicit channel or the default one
//! ```
//!
//! # Design Decisions
//! - Read-only: this crate never writes identity records
//! - Cache is filled lazily and never invalidated; stale reads are accepted
//! - Store and parse failures are logged and reported as not-found
//! - Channel ACL evaluation goes through a pluggable [`ChannelAccessPolicy`]
//! - Successful password checks are remembered for a short TTL, keyed by a
//!   SHA-256 digest, so Basic-auth traffic does not pay for argon2 per request

pub mod identity;
pub mod password;
pub mod store;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

pub use identity::{AccessToken, Channel, ChannelRecord, Identity, IdentityRecord};
pub use store::{FileIdentityStore, IdentityStore, MemoryIdentityStore, StoreError};

/// Decides whether `requester` may direct traffic at `channel` of `owner`.
pub trait ChannelAccessPolicy: Send + Sync + std::fmt::Debug {
    fn may_originate(&self, requester: &str, owner: &Identity, channel: &Channel) -> bool;
}

/// The owner always has access; other identities need an entry in the
/// channel's allowed-identities list.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowedIdentitiesPolicy;

impl ChannelAccessPolicy for AllowedIdentitiesPolicy {
    fn may_originate(&self, requester: &str, owner: &Identity, channel: &Channel) -> bool {
        let requester = normalize_key(requester);
        requester == owner.key || channel.allowed_identities.contains(&requester)
    }
}

/// How long a successful password check is trusted without re-hashing.
pub const DEFAULT_CREDENTIAL_TTL: Duration = Duration::from_secs(60);

/// Expired entries are swept once the credential cache grows past this.
const CREDENTIAL_CACHE_SWEEP_AT: usize = 4096;

/// Identity keys are case-insensitive.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Cached, read-mostly view over an [`IdentityStore`].
#[derive(Debug)]
pub struct Directory {
    store: Arc<dyn IdentityStore>,
    cache: DashMap<String, Arc<Identity>>,
    cache_enabled: bool,
    verified: DashMap<[u8; 32], Instant>,
    credential_ttl: Duration,
    policy: Arc<dyn ChannelAccessPolicy>,
}

impl Directory {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            cache_enabled: true,
            verified: DashMap::new(),
            credential_ttl: DEFAULT_CREDENTIAL_TTL,
            policy: Arc::new(AllowedIdentitiesPolicy),
        }
    }

    /// Zero disables the credential cache.
    pub fn with_credential_ttl(mut self, ttl: Duration) -> Self {
        self.credential_ttl = ttl;
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn ChannelAccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Look up an identity. Failures while filling the cache are logged and
    /// reported as not-found.
    pub async fn resolve(&self, identity_key: &str) -> Option<Arc<Identity>> {
        let key = normalize_key(identity_key);
        if key.is_empty() {
            return None;
        }

        if self.cache_enabled {
            if let Some(identity) = self.cache.get(&key) {
                return Some(Arc::clone(identity.value()));
            }
        }

        let record = match self.store.get(&key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!(identity = %key, "Identity not found");
                return None;
            }
            Err(e) => {
                tracing::warn!(identity = %key, error = %e, "Failed to load identity record");
                return None;
            }
        };

        let identity = match Identity::from_record(&key, record) {
            Ok(identity) => Arc::new(identity),
            Err(e) => {
                tracing::warn!(identity = %key, error = %e, "Rejected invalid identity record");
                return None;
            }
        };

        if self.cache_enabled {
            // A concurrent fill may have won; keep whichever landed first.
            let entry = self.cache.entry(key).or_insert(identity);
            return Some(Arc::clone(entry.value()));
        }
        Some(identity)
    }

    /// Check a password against the identity's stored hash. The caller is
    /// responsible for checking the locked flag.
    pub fn authenticate(&self, identity: &Identity, password: &str) -> bool {
        if self.credential_ttl.is_zero() {
            return password::verify_password(password, &identity.password_hash);
        }

        let digest = credential_digest(identity, password);
        let now = Instant::now();
        if let Some(expires) = self.verified.get(&digest) {
            if *expires > now {
                return true;
            }
        }

        if !password::verify_password(password, &identity.password_hash) {
            self.verified.remove(&digest);
            return false;
        }

        if self.verified.len() >= CREDENTIAL_CACHE_SWEEP_AT {
            self.verified.retain(|_, expires| *expires > now);
        }
        self.verified.insert(digest, now + self.credential_ttl);
        true
    }

    pub fn cached_credentials(&self) -> usize {
        self.verified.len()
    }

    /// Resolve a channel of `identity`; `None` selects the default channel.
    pub fn resolve_channel<'a>(&self, identity: &'a Identity, channel_key: Option<&str>) -> Option<&'a Channel> {
        identity.channel(channel_key)
    }

    /// Find the channel whose access credential matches `token`.
    pub fn resolve_access_token<'a>(&self, identity: &'a Identity, token: &str) -> Option<&'a Channel> {
        identity.channel_by_access_token(token, chrono::Utc::now())
    }

    pub fn may_originate(&self, requester: &str, owner: &Identity, channel: &Channel) -> bool {
        self.policy.may_originate(requester, owner, channel)
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}

/// The stored hash is part of the digest, so a changed password hash never
/// matches an old entry.
fn credential_digest(identity: &Identity, password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(identity.key.as_bytes());
    hasher.update([0]);
    hasher.update(identity.password_hash.as_bytes());
    hasher.update([0]);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}
