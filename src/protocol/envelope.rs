//! Message envelope: the unit exchanged between relay and agent.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::content::{AuthorizeContent, HttpRequestContent, HttpResponseContent, RawContent};

/// Message type tag. The string form is what travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Authorize,
    Ping,
    RpcRequest,
    RpcResponse,
    Raw,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        MessageType::Authorize,
        MessageType::Ping,
        MessageType::RpcRequest,
        MessageType::RpcResponse,
        MessageType::Raw,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Authorize => "authorize",
            MessageType::Ping => "ping",
            MessageType::RpcRequest => "rpc-request",
            MessageType::RpcResponse => "rpc-response",
            MessageType::Raw => "raw",
        }
    }

    /// Whether envelopes of this type must carry a correlation id.
    pub fn is_correlated(&self) -> bool {
        matches!(self, MessageType::RpcRequest | MessageType::RpcResponse)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Token linking an rpc-request to its rpc-response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Typed content. Each variant corresponds to exactly one [`MessageType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Authorize(AuthorizeContent),
    Ping,
    RpcRequest(HttpRequestContent),
    RpcResponse(HttpResponseContent),
    Raw(RawContent),
}

impl Content {
    pub fn message_type(&self) -> MessageType {
        match self {
            Content::Authorize(_) => MessageType::Authorize,
            Content::Ping => MessageType::Ping,
            Content::RpcRequest(_) => MessageType::RpcRequest,
            Content::RpcResponse(_) => MessageType::RpcResponse,
            Content::Raw(_) => MessageType::Raw,
        }
    }
}

/// A message with its routing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub correlation_id: Option<CorrelationId>,
    pub timestamp: DateTime<Utc>,
    pub content: Content,
}

impl Envelope {
    fn new(correlation_id: Option<CorrelationId>, content: Content) -> Self {
        Self {
            correlation_id,
            timestamp: Utc::now(),
            content,
        }
    }

    pub fn authorize(content: AuthorizeContent) -> Self {
        Self::new(None, Content::Authorize(content))
    }

    pub fn ping() -> Self {
        Self::new(None, Content::Ping)
    }

    pub fn rpc_request(correlation_id: CorrelationId, request: HttpRequestContent) -> Self {
        Self::new(Some(correlation_id), Content::RpcRequest(request))
    }

    pub fn rpc_response(correlation_id: CorrelationId, response: HttpResponseContent) -> Self {
        Self::new(Some(correlation_id), Content::RpcResponse(response))
    }

    pub fn raw(content: RawContent) -> Self {
        Self::new(None, Content::Raw(content))
    }

    pub fn message_type(&self) -> MessageType {
        self.content.message_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_tags_parse_back() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>(), Ok(t));
        }
        assert!("http_invoke".parse::<MessageType>().is_err());
    }

    #[test]
    fn only_rpc_types_are_correlated() {
        let correlated: Vec<_> = MessageType::ALL
            .into_iter()
            .filter(MessageType::is_correlated)
            .collect();
        assert_eq!(correlated, [MessageType::RpcRequest, MessageType::RpcResponse]);
    }

    #[test]
    fn constructors_set_correlation() {
        let id = CorrelationId::new();
        let request = Envelope::rpc_request(id, HttpRequestContent::new("GET", "/"));
        assert_eq!(request.correlation_id, Some(id));
        assert_eq!(request.message_type(), MessageType::RpcRequest);
        assert_eq!(Envelope::ping().correlation_id, None);
    }
}
