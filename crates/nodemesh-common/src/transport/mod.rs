//! NodeMesh Transport Layer
//!
//! Framing, envelope formats and outbound TCP connections.
//!
//! # Architecture
//!
//! - **Transport**: persistent TCP connections, one per peer
//! - **Format**: pluggable envelope serialization (JSON by default, postcard)
//! - **Wire Format**: `[4-byte length prefix as u32 big-endian] + [serialized envelope]`
//!
//! # Components
//!
//! - **[`FrameCodec`]**: length-prefixed framing with a maximum frame length
//! - **[`EnvelopeFormat`]** / **[`FormatRegistry`]**: named serializers
//! - **[`EnvelopeCodec`]**: framing plus a format, used by both ends
//! - **[`connect`]**: outbound TCP connection with timeout
//!
//! # Frame Size Limits
//!
//! Frames larger than the configured maximum (65535 bytes by default) are
//! rejected on write and cause the connection to be dropped on read.

pub mod codec;
pub mod format;
pub mod tcp;

pub use codec::{
    EnvelopeCodec, FrameCodec, DEFAULT_MAX_FRAME_LENGTH, LENGTH_PREFIX_SIZE, MAX_ENCODABLE_FRAME_LENGTH,
};
pub use format::{EnvelopeFormat, FormatRegistry, JsonFormat, PostcardFormat, DEFAULT_FORMAT};
pub use tcp::{connect, map_io_error, DEFAULT_CONNECT_TIMEOUT};
