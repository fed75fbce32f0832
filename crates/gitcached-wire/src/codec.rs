//! Incremental pkt-line decoding.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

use crate::frame::{Band, Frame};
use crate::{Result, WireError};

/// An event produced by the decoder.
///
/// Every frame, flush included, produces a [`FrameEvent::Message`]
/// carrying the undivided payload. When sideband interpretation is
/// enabled and the first payload byte names a channel, a
/// [`FrameEvent::Band`] event follows immediately with the channel
/// byte stripped, so channel-aware and channel-unaware consumers both
/// see every frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete frame, flush marker included.
    Message(Frame),
    /// The sideband view of the preceding message.
    Band(Band, Bytes),
}

/// Incremental decoder over arbitrarily chunked input.
///
/// Bytes are appended with [`FrameDecoder::extend`] (or read directly
/// into [`FrameDecoder::buffer_mut`]); complete frames are drained with
/// [`FrameDecoder::next`]. Partial frames are retained across calls, so
/// a frame split at any byte offset decodes identically to one arriving
/// whole.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    pending: VecDeque<FrameEvent>,
    sideband: bool,
}

impl FrameDecoder {
    /// A decoder with sideband interpretation enabled.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            pending: VecDeque::new(),
            sideband: true,
        }
    }

    /// Enables or disables sideband classification for this stream.
    pub fn set_sideband(&mut self, enabled: bool) {
        self.sideband = enabled;
    }

    /// Appends raw transport bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Direct access to the input buffer, for zero-copy reads.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// True when a partial frame is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// The next decoded event, or `None` when more input is needed.
    pub fn next(&mut self) -> Result<Option<FrameEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        let Some(frame) = self.parse_frame()? else {
            return Ok(None);
        };
        if self.sideband {
            if let Some(band) = frame.band() {
                self.pending
                    .push_back(FrameEvent::Band(band, frame.band_payload()));
            }
        }
        Ok(Some(FrameEvent::Message(frame)))
    }

    fn parse_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let declared = parse_len(&self.buf[..4])?;
        if declared == 0 {
            self.buf.advance(4);
            return Ok(Some(Frame::flush()));
        }
        if declared < 4 {
            return Err(WireError::InvalidLength {
                prefix: String::from_utf8_lossy(&self.buf[..4]).into_owned(),
            });
        }
        if self.buf.len() < declared {
            // Partial frame, wait for the next chunk.
            return Ok(None);
        }
        let mut raw = self.buf.split_to(declared);
        raw.advance(4);
        Ok(Some(Frame::new(raw.freeze())))
    }
}

fn parse_len(prefix: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(prefix).map_err(|_| WireError::InvalidLength {
        prefix: String::from_utf8_lossy(prefix).into_owned(),
    })?;
    usize::from_str_radix(text, 16).map_err(|_| WireError::InvalidLength {
        prefix: text.to_owned(),
    })
}
