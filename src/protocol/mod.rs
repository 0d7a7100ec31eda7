//! Tunnel wire protocol.
//!
//! # Data Flow
//! ```text
//! Outbound:
//!     Envelope (typed Content)
//!     → content.rs (postcard-encoded payload, fixed field order)
//!     → codec.rs (optional deflate, frame header with type tag)
//!     → bytes handed to the session sink
//!
//! Inbound:
//!     bytes from the session source
//!     → codec.rs phase 1: decode frame header, read type tag
//!     → compare tag against what the receiver expects
//!     → codec.rs phase 2: decode payload into typed Content
//! ```
//!
//! # Design Decisions
//! - Type tags are strings so unknown tags from newer agents are reported, not crashed on
//! - Payload decoding never runs before the tag check
//! - HTTP bodies are opaque bytes; headers are the only open map

pub mod codec;
pub mod content;
pub mod envelope;

pub use codec::{Codec, CodecError, Frame};
pub use content::{AuthorizeContent, Headers, HttpRequestContent, HttpResponseContent, RawContent};
pub use envelope::{Content, CorrelationId, Envelope, MessageType};
