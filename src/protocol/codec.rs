//! Frame encoding and two-phase decoding.
//!
//! A frame is a postcard-encoded header (type tag, correlation id, timestamp,
//! compression flag) followed by the payload bytes. The payload is itself the
//! postcard encoding of the typed content for that tag, deflated when it
//! exceeds the compression threshold.

use std::io::{Read, Write};

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::content::{AuthorizeContent, HttpRequestContent, HttpResponseContent, RawContent};
use super::envelope::{Content, CorrelationId, Envelope, MessageType};

/// Payloads larger than this are compressed unless configured otherwise.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 4096;

/// Largest payload accepted after decompression, unless configured otherwise.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Errors produced while encoding or decoding frames.
///
/// Every decode failure is a malformed message from the receiver's point of
/// view; the variants only say which check rejected it.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Frame(#[source] postcard::Error),

    #[error("unknown message type tag '{0}'")]
    UnknownTag(String),

    #[error("expected '{expected}' message, got '{actual}'")]
    TagMismatch {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("'{0}' messages are not accepted in this direction")]
    Unexpected(MessageType),

    #[error("'{tag}' message {problem}")]
    Correlation {
        tag: MessageType,
        problem: &'static str,
    },

    #[error("invalid timestamp '{0}'")]
    Timestamp(String),

    #[error("malformed '{tag}' content: {source}")]
    Content {
        tag: MessageType,
        #[source]
        source: postcard::Error,
    },

    #[error("payload exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("payload compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("failed to encode '{tag}' message: {source}")]
    Encode {
        tag: MessageType,
        #[source]
        source: postcard::Error,
    },
}

impl CodecError {
    /// True when the frame was well formed but of another type.
    pub fn is_tag_mismatch(&self) -> bool {
        matches!(self, CodecError::TagMismatch { .. })
    }
}

#[derive(Serialize, Deserialize)]
struct FrameHeader {
    tag: String,
    correlation_id: Option<CorrelationId>,
    timestamp: String,
    compressed: bool,
    payload: Vec<u8>,
}

/// A frame whose header has been decoded but whose payload has not.
#[derive(Debug)]
pub struct Frame {
    tag: String,
    correlation_id: Option<CorrelationId>,
    timestamp: String,
    compressed: bool,
    payload: Vec<u8>,
    max_payload: usize,
}

impl Frame {
    /// The declared type, or `UnknownTag` for tags this build does not know.
    pub fn message_type(&self) -> Result<MessageType, CodecError> {
        self.tag
            .parse()
            .map_err(CodecError::UnknownTag)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    /// Second phase: check the tag against `expected`, then decode the
    /// payload. The payload is never touched when the tag does not match.
    pub fn into_envelope(self, expected: MessageType) -> Result<Envelope, CodecError> {
        let actual = self.message_type()?;
        if actual != expected {
            return Err(CodecError::TagMismatch { expected, actual });
        }

        match (actual.is_correlated(), self.correlation_id.is_some()) {
            (true, false) => {
                return Err(CodecError::Correlation {
                    tag: actual,
                    problem: "is missing its correlation id",
                })
            }
            (false, true) => {
                return Err(CodecError::Correlation {
                    tag: actual,
                    problem: "must not carry a correlation id",
                })
            }
            _ => {}
        }

        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| CodecError::Timestamp(self.timestamp.clone()))?;

        let payload = if self.compressed {
            inflate(&self.payload, self.max_payload)?
        } else if self.payload.len() > self.max_payload {
            return Err(CodecError::TooLarge { limit: self.max_payload });
        } else {
            self.payload
        };

        let content = match actual {
            MessageType::Authorize => Content::Authorize(decode_content::<AuthorizeContent>(actual, &payload)?),
            MessageType::Ping => Content::Ping,
            MessageType::RpcRequest => Content::RpcRequest(decode_content::<HttpRequestContent>(actual, &payload)?),
            MessageType::RpcResponse => Content::RpcResponse(decode_content::<HttpResponseContent>(actual, &payload)?),
            MessageType::Raw => Content::Raw(decode_content::<RawContent>(actual, &payload)?),
        };

        Ok(Envelope {
            correlation_id: self.correlation_id,
            timestamp,
            content,
        })
    }
}

fn decode_content<T: DeserializeOwned>(tag: MessageType, payload: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(payload).map_err(|source| CodecError::Content { tag, source })
}

fn encode_content<T: Serialize>(tag: MessageType, value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|source| CodecError::Encode { tag, source })
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflate at most `limit` bytes; anything beyond is rejected unread.
fn inflate(data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
    let mut decoder = DeflateDecoder::new(data).take((limit as u64).saturating_add(1));
    let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(limit));
    decoder.read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(CodecError::TooLarge { limit });
    }
    Ok(out)
}

/// Envelope encoder/decoder.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    compression_threshold: usize,
    max_payload: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD)
    }
}

impl Codec {
    /// `compression_threshold` of 0 disables compression.
    pub fn new(compression_threshold: usize) -> Self {
        Self {
            compression_threshold,
            max_payload: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    /// Reject payloads that decode to more than `bytes`.
    pub fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes, CodecError> {
        let tag = envelope.message_type();
        let payload = match &envelope.content {
            Content::Authorize(c) => encode_content(tag, c)?,
            Content::Ping => Vec::new(),
            Content::RpcRequest(c) => encode_content(tag, c)?,
            Content::RpcResponse(c) => encode_content(tag, c)?,
            Content::Raw(c) => encode_content(tag, c)?,
        };

        let compressed = self.compression_threshold > 0 && payload.len() > self.compression_threshold;
        let payload = if compressed { deflate(&payload)? } else { payload };

        let header = FrameHeader {
            tag: tag.as_str().to_string(),
            correlation_id: envelope.correlation_id,
            timestamp: envelope.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            compressed,
            payload,
        };

        postcard::to_allocvec(&header)
            .map(Bytes::from)
            .map_err(|source| CodecError::Encode { tag, source })
    }

    /// First phase: decode only the frame header.
    pub fn decode_frame(&self, bytes: &[u8]) -> Result<Frame, CodecError> {
        let header: FrameHeader = postcard::from_bytes(bytes).map_err(CodecError::Frame)?;
        Ok(Frame {
            tag: header.tag,
            correlation_id: header.correlation_id,
            timestamp: header.timestamp,
            compressed: header.compressed,
            payload: header.payload,
            max_payload: self.max_payload,
        })
    }

    /// Decode a message the caller expects to be of type `expected`.
    pub fn decode(&self, bytes: &[u8], expected: MessageType) -> Result<Envelope, CodecError> {
        self.decode_frame(bytes)?.into_envelope(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_body() -> Vec<u8> {
        vec![0x00, 0xff, 0xfe, 0x80, 0x7f, 0xc3, 0x28]
    }

    #[test]
    fn rpc_request_round_trip_with_binary_body() {
        let codec = Codec::default();
        let request = HttpRequestContent::new("POST", "/api/upload?x=1")
            .with_header("Content-Type", "application/octet-stream")
            .with_header("X-Multi", "a")
            .with_header("x-multi", "b")
            .with_body(binary_body());
        let envelope = Envelope::rpc_request(CorrelationId::new(), request.clone());

        let bytes = codec.encode(&envelope).unwrap();
        let decoded = codec.decode(&bytes, MessageType::RpcRequest).unwrap();

        assert_eq!(decoded.correlation_id, envelope.correlation_id);
        assert_eq!(decoded.content, Content::RpcRequest(request));
    }

    #[test]
    fn rpc_response_round_trip_with_empty_body_and_unset_status() {
        let codec = Codec::default();
        let response = HttpResponseContent::default();
        let envelope = Envelope::rpc_response(CorrelationId::new(), response.clone());

        let decoded = codec
            .decode(&codec.encode(&envelope).unwrap(), MessageType::RpcResponse)
            .unwrap();
        let Content::RpcResponse(decoded) = decoded.content else {
            panic!("wrong content variant");
        };
        assert_eq!(decoded, response);
        assert_eq!(decoded.status_code(), 200);
    }

    #[test]
    fn tag_mismatch_is_reported_without_decoding_payload() {
        let codec = Codec::default();
        let bytes = codec.encode(&Envelope::ping()).unwrap();

        let err = codec.decode(&bytes, MessageType::RpcResponse).unwrap_err();
        assert!(err.is_tag_mismatch());
        assert!(matches!(
            err,
            CodecError::TagMismatch {
                expected: MessageType::RpcResponse,
                actual: MessageType::Ping
            }
        ));
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let header = FrameHeader {
            tag: "wirehome.cloud.message.http_invoke".into(),
            correlation_id: None,
            timestamp: Utc::now().to_rfc3339(),
            compressed: false,
            payload: Vec::new(),
        };
        let bytes = postcard::to_allocvec(&header).unwrap();

        let frame = Codec::default().decode_frame(&bytes).unwrap();
        assert!(matches!(frame.message_type(), Err(CodecError::UnknownTag(_))));
    }

    #[test]
    fn garbage_is_malformed_frame() {
        let err = Codec::default().decode(&[0xff, 0xff, 0xff], MessageType::Ping).unwrap_err();
        assert!(matches!(err, CodecError::Frame(_)));
    }

    #[test]
    fn rpc_without_correlation_is_rejected() {
        let header = FrameHeader {
            tag: "rpc-response".into(),
            correlation_id: None,
            timestamp: Utc::now().to_rfc3339(),
            compressed: false,
            payload: postcard::to_allocvec(&HttpResponseContent::new(200)).unwrap(),
        };
        let bytes = postcard::to_allocvec(&header).unwrap();

        let err = Codec::default().decode(&bytes, MessageType::RpcResponse).unwrap_err();
        assert!(matches!(err, CodecError::Correlation { .. }));
    }

    #[test]
    fn wrong_shape_for_tag_is_content_error() {
        let header = FrameHeader {
            tag: "rpc-request".into(),
            correlation_id: Some(CorrelationId::new()),
            timestamp: Utc::now().to_rfc3339(),
            compressed: false,
            payload: vec![0xff],
        };
        let bytes = postcard::to_allocvec(&header).unwrap();

        let err = Codec::default().decode(&bytes, MessageType::RpcRequest).unwrap_err();
        assert!(matches!(err, CodecError::Content { tag: MessageType::RpcRequest, .. }));
    }

    #[test]
    fn large_payloads_are_compressed() {
        let codec = Codec::new(64);
        let body = vec![b'a'; 10_000];
        let envelope = Envelope::rpc_response(
            CorrelationId::new(),
            HttpResponseContent::new(200).with_body(body.clone()),
        );

        let bytes = codec.encode(&envelope).unwrap();
        assert!(bytes.len() < body.len() / 4);

        let frame = codec.decode_frame(&bytes).unwrap();
        assert!(frame.compressed);
        let decoded = frame.into_envelope(MessageType::RpcResponse).unwrap();
        let Content::RpcResponse(response) = decoded.content else {
            panic!("wrong content variant");
        };
        assert_eq!(response.body, body);
    }

    #[test]
    fn inflated_payload_is_capped() {
        let body = vec![0u8; 1024 * 1024];
        let envelope = Envelope::rpc_response(
            CorrelationId::new(),
            HttpResponseContent::new(200).with_body(body),
        );
        let bytes = Codec::new(64).encode(&envelope).unwrap();
        assert!(bytes.len() < 16 * 1024);

        let strict = Codec::new(64).with_max_payload(64 * 1024);
        let err = strict.decode(&bytes, MessageType::RpcResponse).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { limit } if limit == 64 * 1024));

        assert!(Codec::new(64).decode(&bytes, MessageType::RpcResponse).is_ok());
    }

    #[test]
    fn uncompressed_payload_is_capped() {
        let envelope = Envelope::raw(RawContent::new("blob", vec![7u8; 4096]));
        let bytes = Codec::new(0).encode(&envelope).unwrap();
        let err = Codec::new(0).with_max_payload(1024).decode(&bytes, MessageType::Raw).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { .. }));
    }

    #[test]
    fn authorize_round_trip() {
        let codec = Codec::default();
        let content = AuthorizeContent {
            identity_key: "alice".into(),
            password: "secret".into(),
            channel_key: Some("home".into()),
        };
        let decoded = codec
            .decode(&codec.encode(&Envelope::authorize(content.clone())).unwrap(), MessageType::Authorize)
            .unwrap();
        assert_eq!(decoded.content, Content::Authorize(content));
        assert_eq!(decoded.correlation_id, None);
    }
}
