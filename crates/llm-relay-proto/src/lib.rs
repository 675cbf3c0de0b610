//! Tunnel Protocol Definitions
//!
//! Envelope types exchanged between the relay and a user's local agent,
//! the payloads they carry, and the length-prefixed codec used on the wire.

pub mod codec;
pub mod error_code;
pub mod messages;

pub use codec::{CodecError, EnvelopeCodec};
pub use error_code::ErrorCode;
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Correlation id used for the first frame the relay sends after a handshake
pub const HANDSHAKE_ID: &str = "handshake";

/// Handshake header naming the tunnel an agent wants to resume
pub const RESUME_HEADER: &str = "x-tunnel-resume";
