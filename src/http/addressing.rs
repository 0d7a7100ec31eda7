//! Resolving which session a public request is meant for.
//!
//! Two schemes are accepted:
//! - `Authorization: Basic` with the caller's identity and password, plus an
//!   optional `X-Relay-Channel` naming one of the caller's channels or
//!   `owner/channel` for a channel whose ACL lists the caller.
//! - `X-Relay-Identity` with `X-Relay-Access-Token`, matched against the
//!   identity's channel access credentials.

use std::sync::Arc;

use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::directory::{normalize_key, Identity};
use crate::session::{Session, SessionKey, SessionNotFound, SessionRegistry};

pub const CHANNEL_HEADER: &str = "x-relay-channel";
pub const IDENTITY_HEADER: &str = "x-relay-identity";
pub const ACCESS_TOKEN_HEADER: &str = "x-relay-access-token";

/// Headers consumed by the relay and never forwarded to agents.
pub const RELAY_HEADERS: [&str; 3] = [CHANNEL_HEADER, IDENTITY_HEADER, ACCESS_TOKEN_HEADER];

/// Addressing information carried by a public request.
#[derive(Clone, PartialEq, Eq)]
pub enum Addressing {
    Credentials {
        identity: String,
        password: String,
        channel: Option<String>,
    },
    AccessToken {
        identity: String,
        token: String,
    },
}

impl std::fmt::Debug for Addressing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Addressing::Credentials { identity, channel, .. } => f
                .debug_struct("Credentials")
                .field("identity", identity)
                .field("channel", channel)
                .finish_non_exhaustive(),
            Addressing::AccessToken { identity, .. } => f
                .debug_struct("AccessToken")
                .field("identity", identity)
                .finish_non_exhaustive(),
        }
    }
}

impl Addressing {
    /// Whether the `Authorization` header belongs to the relay rather than
    /// to the hub.
    pub fn consumes_authorization(&self) -> bool {
        matches!(self, Addressing::Credentials { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AddressingError {
    #[error("request carries no relay addressing")]
    Missing,
    #[error("authorization failed")]
    Denied,
    #[error(transparent)]
    Offline(#[from] SessionNotFound),
}

/// Extract addressing from request headers. Access-token headers take
/// precedence over basic credentials.
pub fn parse(headers: &HeaderMap) -> Result<Addressing, AddressingError> {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let (Some(identity), Some(token)) = (text(IDENTITY_HEADER), text(ACCESS_TOKEN_HEADER)) {
        return Ok(Addressing::AccessToken {
            identity: identity.to_string(),
            token: token.to_string(),
        });
    }

    let authorization = text(header::AUTHORIZATION.as_str()).ok_or(AddressingError::Missing)?;
    let (scheme, encoded) = authorization.split_once(' ').ok_or(AddressingError::Denied)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AddressingError::Missing);
    }
    let decoded = STANDARD
        .decode(encoded.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(AddressingError::Denied)?;
    let (identity, password) = decoded.split_once(':').ok_or(AddressingError::Denied)?;

    Ok(Addressing::Credentials {
        identity: identity.to_string(),
        password: password.to_string(),
        channel: text(CHANNEL_HEADER).map(str::to_string),
    })
}

/// Resolve addressing to a live session.
///
/// Every credential or ACL failure is reported as [`AddressingError::Denied`]
/// without saying which check failed.
pub async fn resolve(registry: &SessionRegistry, addressing: &Addressing) -> Result<Arc<Session>, AddressingError> {
    let directory = registry.directory();
    match addressing {
        Addressing::AccessToken { identity, token } => {
            let owner = active_identity(registry, identity).await?;
            let channel = directory
                .resolve_access_token(&owner, token)
                .ok_or(AddressingError::Denied)?;
            Ok(registry.lookup_key(&SessionKey::new(&owner.key, &channel.key))?)
        }
        Addressing::Credentials {
            identity,
            password,
            channel,
        } => {
            let caller = active_identity(registry, identity).await?;
            let verified = {
                let directory = Arc::clone(directory);
                let caller = Arc::clone(&caller);
                let password = password.clone();
                tokio::task::spawn_blocking(move || directory.authenticate(&caller, &password))
                    .await
                    .unwrap_or(false)
            };
            if !verified {
                return Err(AddressingError::Denied);
            }

            match channel.as_deref().and_then(|c| c.split_once('/')) {
                Some((owner_key, channel_key)) if normalize_key(owner_key) != caller.key => {
                    let owner = active_identity(registry, owner_key).await?;
                    let target = directory
                        .resolve_channel(&owner, Some(channel_key))
                        .filter(|target| directory.may_originate(&caller.key, &owner, target))
                        .ok_or(AddressingError::Denied)?;
                    Ok(registry.lookup_key(&SessionKey::new(&owner.key, &target.key))?)
                }
                Some((_, channel_key)) => Ok(registry.lookup(&caller.key, Some(channel_key)).await?),
                None => Ok(registry.lookup(&caller.key, channel.as_deref()).await?),
            }
        }
    }
}

/// An identity that exists and is not locked.
async fn active_identity(registry: &SessionRegistry, key: &str) -> Result<Arc<Identity>, AddressingError> {
    registry
        .directory()
        .resolve(key)
        .await
        .filter(|identity| !identity.is_locked)
        .ok_or(AddressingError::Denied)
}
