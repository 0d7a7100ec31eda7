//! Identity and channel records.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use super::normalize_key;

/// Stored form of an identity, as read from the configuration store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityRecord {
    /// Argon2 PHC string.
    pub password_hash: String,
    pub is_admin: bool,
    pub is_locked: bool,
    pub channels: HashMap<String, ChannelRecord>,
}

impl IdentityRecord {
    /// Record with a freshly hashed password. Intended for tests and tooling.
    pub fn with_password(password: &str) -> Self {
        Self {
            password_hash: super::password::hash_password(password).unwrap_or_default(),
            ..Self::default()
        }
    }

    pub fn with_channel(mut self, key: &str, channel: ChannelRecord) -> Self {
        self.channels.insert(key.to_string(), channel);
        self
    }

    pub fn locked(mut self) -> Self {
        self.is_locked = true;
        self
    }
}

/// Stored form of a channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelRecord {
    pub is_default: bool,
    pub access_token: Option<AccessToken>,
    pub allowed_identities: Vec<String>,
}

impl ChannelRecord {
    pub fn default_channel() -> Self {
        Self {
            is_default: true,
            ..Self::default()
        }
    }

    pub fn with_access_token(mut self, value: &str) -> Self {
        self.access_token = Some(AccessToken {
            value: value.to_string(),
            valid_until: None,
        });
        self
    }

    pub fn allow(mut self, identity_key: &str) -> Self {
        self.allowed_identities.push(identity_key.to_string());
        self
    }
}

/// Opaque secret routing public requests to a channel.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("valid_until", &self.valid_until)
            .finish()
    }
}

impl AccessToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.map_or(true, |until| until > now)
    }
}

/// Errors found while turning a record into an [`Identity`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("identity has no password hash")]
    MissingPasswordHash,
    #[error("more than one default channel: {0:?}")]
    MultipleDefaults(Vec<String>),
    #[error("channel key '{0}' is duplicated after normalization")]
    DuplicateChannel(String),
}

/// Authorization principal.
#[derive(Debug, Clone)]
pub struct Identity {
    pub key: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub is_locked: bool,
    pub channels: HashMap<String, Channel>,
}

/// One exposed endpoint of an identity.
#[derive(Debug, Clone)]
pub struct Channel {
    pub key: String,
    pub is_default: bool,
    pub access_token: Option<AccessToken>,
    pub allowed_identities: HashSet<String>,
}

impl Identity {
    pub fn from_record(key: &str, record: IdentityRecord) -> Result<Self, RecordError> {
        if record.password_hash.is_empty() {
            return Err(RecordError::MissingPasswordHash);
        }

        let mut channels = HashMap::with_capacity(record.channels.len());
        for (channel_key, channel) in record.channels {
            let channel_key = normalize_key(&channel_key);
            let channel = Channel {
                key: channel_key.clone(),
                is_default: channel.is_default,
                access_token: channel.access_token,
                allowed_identities: channel
                    .allowed_identities
                    .iter()
                    .map(|k| normalize_key(k))
                    .collect(),
            };
            if channels.insert(channel_key.clone(), channel).is_some() {
                return Err(RecordError::DuplicateChannel(channel_key));
            }
        }

        let mut defaults: Vec<String> = channels
            .values()
            .filter(|c| c.is_default)
            .map(|c| c.key.clone())
            .collect();
        if defaults.len() > 1 {
            defaults.sort();
            return Err(RecordError::MultipleDefaults(defaults));
        }

        Ok(Self {
            key: normalize_key(key),
            password_hash: record.password_hash,
            is_admin: record.is_admin,
            is_locked: record.is_locked,
            channels,
        })
    }

    /// Explicit channel by key, or the default channel when `key` is `None`.
    pub fn channel(&self, key: Option<&str>) -> Option<&Channel> {
        match key {
            Some(key) => self.channels.get(&normalize_key(key)),
            None => self.default_channel(),
        }
    }

    pub fn default_channel(&self) -> Option<&Channel> {
        self.channels.values().find(|c| c.is_default)
    }

    /// Channel whose access credential equals `token` and has not expired.
    pub fn channel_by_access_token(&self, token: &str, now: DateTime<Utc>) -> Option<&Channel> {
        self.channels.values().find(|c| {
            c.access_token
                .as_ref()
                .is_some_and(|t| t.is_valid_at(now) && constant_time_eq(&t.value, token))
        })
    }
}

/// Constant-time string comparison.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
