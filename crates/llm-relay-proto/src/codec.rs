//! Codec for encoding/decoding tunnel envelopes

use crate::messages::{Envelope, EnvelopeKind};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Trailing bytes after frame: {0}")]
    TrailingBytes(usize),

    #[error("Expected {expected:?} envelope, got {actual:?}")]
    UnexpectedKind {
        expected: EnvelopeKind,
        actual: EnvelopeKind,
    },
}

/// Tunnel envelope codec
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Maximum message size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = crate::MAX_FRAME_SIZE as usize;

    /// Encode an envelope to bytes
    ///
    /// Format: [length: u32][payload: bincode serialized envelope]
    pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(envelope)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode an envelope from a stream buffer
    ///
    /// Returns Ok(Some(envelope)) if a complete frame was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let frame = buf.split_to(length);
        let envelope: Envelope = bincode::deserialize(&frame)?;

        Ok(Some(envelope))
    }

    /// Decode exactly one frame from a message-oriented transport (one WebSocket message)
    pub fn decode_frame(data: &[u8]) -> Result<Envelope, CodecError> {
        let mut buf = BytesMut::from(data);
        match Self::decode(&mut buf)? {
            Some(envelope) if buf.is_empty() => Ok(envelope),
            Some(_) => Err(CodecError::TrailingBytes(buf.len())),
            None => Err(CodecError::SerializationError(Box::new(
                bincode::ErrorKind::Custom("incomplete frame".to_string()),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ProxyResponse;

    #[test]
    fn test_encode_decode() {
        let envelope = Envelope::ping("hb-1", 12345).unwrap();

        let encoded = EnvelopeCodec::encode(&envelope).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded = EnvelopeCodec::decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(envelope));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_incomplete() {
        let envelope = Envelope::pong("hb-2", 67890).unwrap();
        let encoded = EnvelopeCodec::encode(&envelope).unwrap();

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(EnvelopeCodec::decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(EnvelopeCodec::decode(&mut buf).unwrap(), Some(envelope));
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        assert!(matches!(
            EnvelopeCodec::decode(&mut buf),
            Err(CodecError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn test_decode_frame_rejects_trailing_bytes() {
        let envelope = Envelope::response("req-1", &ProxyResponse::new(200, "ok")).unwrap();
        let mut data = EnvelopeCodec::encode(&envelope).unwrap().to_vec();
        data.extend_from_slice(&[1, 2, 3]);

        assert!(matches!(
            EnvelopeCodec::decode_frame(&data),
            Err(CodecError::TrailingBytes(3))
        ));
    }

    #[test]
    fn test_decode_frame_garbage() {
        assert!(EnvelopeCodec::decode_frame(&[0, 0]).is_err());
    }
}
