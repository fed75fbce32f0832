//! Pkt-line frames and sideband classification.

use bytes::{BufMut, Bytes, BytesMut};

/// The literal flush marker as it appears on the wire.
pub const FLUSH_BYTES: &[u8; 4] = b"0000";

/// Largest payload a single frame can carry: 0xffff minus the 4-byte
/// length prefix.
pub const MAX_PAYLOAD_LEN: usize = 0xffff - 4;

/// A sideband channel, selected by the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// Channel 1: raw pack data.
    Pack,
    /// Channel 2: progress and diagnostic text.
    Progress,
    /// Channel 3: fatal remote error.
    Error,
}

impl Band {
    /// Classifies a payload's first byte, if it names a channel.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Pack),
            2 => Some(Self::Progress),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    /// The wire byte for this channel.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Pack => 1,
            Self::Progress => 2,
            Self::Error => 3,
        }
    }
}

/// One decoded pkt-line frame.
///
/// A frame with an empty payload is the flush marker; its declared
/// length on the wire is zero. Every other frame's declared length
/// counts the 4-byte prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    /// Creates a data frame. An empty payload yields the flush marker.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// The flush marker.
    pub fn flush() -> Self {
        Self {
            payload: Bytes::new(),
        }
    }

    /// True for the zero-length flush marker.
    pub fn is_flush(&self) -> bool {
        self.payload.is_empty()
    }

    /// The full, undivided payload (sideband byte included, if any).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The length this frame declares on the wire: 0 for flush,
    /// payload + 4 otherwise.
    pub fn declared_len(&self) -> usize {
        if self.is_flush() {
            0
        } else {
            self.payload.len() + 4
        }
    }

    /// The sideband channel of this frame, if the first payload byte
    /// names one. Flush frames carry no channel.
    pub fn band(&self) -> Option<Band> {
        self.payload.first().copied().and_then(Band::from_byte)
    }

    /// The payload with the sideband byte stripped. Empty when the
    /// frame is not a sideband frame.
    pub fn band_payload(&self) -> Bytes {
        if self.band().is_some() {
            self.payload.slice(1..)
        } else {
            Bytes::new()
        }
    }

    /// Re-encodes this frame to its exact wire form.
    pub fn encode(&self) -> Bytes {
        encode(&self.payload)
    }
}

/// Encodes a payload as a pkt-line frame. An empty payload encodes the
/// flush marker.
pub fn encode(payload: &[u8]) -> Bytes {
    if payload.is_empty() {
        return Bytes::from_static(FLUSH_BYTES);
    }
    debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);
    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    let len = payload.len() + 4;
    buf.put_slice(format!("{len:04x}").as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_data() {
        assert_eq!(&encode(b"hello\n")[..], b"000ahello\n");
    }

    #[test]
    fn test_encode_flush() {
        assert_eq!(&encode(b"")[..], b"0000");
        assert_eq!(&Frame::flush().encode()[..], b"0000");
    }

    #[test]
    fn test_declared_len() {
        assert_eq!(Frame::flush().declared_len(), 0);
        assert_eq!(Frame::new(&b"abc"[..]).declared_len(), 7);
    }

    #[test]
    fn test_band_classification() {
        assert_eq!(Frame::new(&b"\x01PACK"[..]).band(), Some(Band::Pack));
        assert_eq!(Frame::new(&b"\x02hi"[..]).band(), Some(Band::Progress));
        assert_eq!(Frame::new(&b"\x03oops"[..]).band(), Some(Band::Error));
        assert_eq!(Frame::new(&b"want x"[..]).band(), None);
        assert_eq!(Frame::flush().band(), None);
    }

    #[test]
    fn test_band_payload_strips_channel_byte() {
        let frame = Frame::new(&b"\x02progress"[..]);
        assert_eq!(&frame.band_payload()[..], b"progress");
        assert_eq!(frame.payload(), b"\x02progress");
    }

    #[test]
    fn test_band_bytes_roundtrip() {
        for band in [Band::Pack, Band::Progress, Band::Error] {
            assert_eq!(Band::from_byte(band.as_byte()), Some(band));
        }
        assert_eq!(Band::from_byte(0), None);
        assert_eq!(Band::from_byte(4), None);
    }
}
