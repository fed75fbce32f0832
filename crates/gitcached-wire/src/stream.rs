//! Framed duplex stream over any async byte transport.
//!
//! [`PktStream`] wraps a read half and a write half and exposes the
//! pkt-line conversation as a sequence of [`StreamEvent`]s. The same
//! type fronts TCP sockets and child-process pipes, so the connection
//! engine never branches on what kind of transport it is talking to.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{FrameDecoder, FrameEvent};
use crate::frame::{self, Band, Frame};
use crate::Result;

/// Boxed read half, erasing the concrete transport.
pub type DynReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half, erasing the concrete transport.
pub type DynWriter = Box<dyn AsyncWrite + Send + Unpin>;
/// The stream type the engine passes around.
pub type DynPktStream = PktStream<DynReader, DynWriter>;

/// One observable event on a framed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A complete frame, flush frames included.
    Frame(Frame),
    /// Sideband classification of the frame delivered just before it.
    Band(Band, Bytes),
    /// End of input. Repeats on every subsequent poll.
    Closed,
}

/// A framed duplex stream: pkt-line events in, pkt-line frames out.
pub struct PktStream<R, W> {
    reader: Option<R>,
    writer: Option<W>,
    decoder: FrameDecoder,
    queued: VecDeque<StreamEvent>,
    paused: bool,
    eof: bool,
    broken_write: bool,
    label: String,
}

impl PktStream<DynReader, DynWriter> {
    /// Boxes the halves of a concrete transport into a [`DynPktStream`].
    pub fn boxed<R, W>(reader: R, writer: W) -> DynPktStream
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        PktStream::new(Box::new(reader) as DynReader, Box::new(writer) as DynWriter)
    }
}

impl<R, W> PktStream<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Some(reader),
            writer: Some(writer),
            decoder: FrameDecoder::new(),
            queued: VecDeque::new(),
            paused: false,
            eof: false,
            broken_write: false,
            label: String::from("stream"),
        }
    }

    /// Tags log lines emitted by this stream.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Enables or disables sideband classification of incoming frames.
    pub fn set_sideband(&mut self, on: bool) {
        self.decoder.set_sideband(on);
    }

    /// Stops delivering events. Input already decoded stays queued in
    /// arrival order and is replayed, in order, after [`resume`].
    ///
    /// [`resume`]: PktStream::resume
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Next event on the stream. Returns [`StreamEvent::Closed`] once the
    /// peer has shut down its write side, and keeps returning it.
    ///
    /// Cancel safe: a read interrupted by `select!` leaves partial bytes
    /// in the decoder buffer, never dropped.
    pub async fn next_event(&mut self) -> Result<StreamEvent> {
        loop {
            if !self.paused {
                if let Some(event) = self.queued.pop_front() {
                    return Ok(event);
                }
                while let Some(event) = self.decoder.next()? {
                    self.queued.push_back(match event {
                        FrameEvent::Message(frame) => StreamEvent::Frame(frame),
                        FrameEvent::Band(band, payload) => StreamEvent::Band(band, payload),
                    });
                }
                if let Some(event) = self.queued.pop_front() {
                    return Ok(event);
                }
                if self.eof {
                    return Ok(StreamEvent::Closed);
                }
            } else if self.eof && self.queued.is_empty() && !self.decoder.has_partial() {
                // A paused stream still reports a dead peer.
                return Ok(StreamEvent::Closed);
            }

            let reader = match self.reader.as_mut() {
                Some(reader) if !self.eof => reader,
                _ => {
                    self.eof = true;
                    if self.paused {
                        // Nothing more will arrive; wait for resume.
                        std::future::pending::<()>().await;
                    }
                    continue;
                }
            };
            let n = reader.read_buf(self.decoder.buffer_mut()).await?;
            if n == 0 {
                self.eof = true;
                self.reader = None;
            }
            while let Some(event) = self.decoder.next()? {
                self.queued.push_back(match event {
                    FrameEvent::Message(frame) => StreamEvent::Frame(frame),
                    FrameEvent::Band(band, payload) => StreamEvent::Band(band, payload),
                });
            }
        }
    }

    /// Sends one frame. An empty payload encodes as a flush frame.
    ///
    /// Writes to a peer that has gone away are dropped with a warning
    /// rather than surfaced, so a dying client cannot poison the
    /// remainder of a transfer that other state still depends on.
    pub async fn send(&mut self, payload: &[u8]) {
        let encoded = frame::encode(payload);
        self.write_all(&encoded).await;
    }

    /// Sends a flush frame (`0000`).
    pub async fn send_flush(&mut self) {
        self.write_all(frame::FLUSH_BYTES).await;
    }

    /// Sends a payload on the given sideband channel.
    pub async fn send_band(&mut self, band: Band, payload: &[u8]) {
        let mut framed = Vec::with_capacity(payload.len() + 1);
        framed.push(band.as_byte());
        framed.extend_from_slice(payload);
        self.send(&framed).await;
    }

    /// Writes already-framed bytes verbatim. Used when relaying pack
    /// data, which must not be re-framed.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.write_all(bytes).await;
    }

    async fn write_all(&mut self, bytes: &[u8]) {
        if self.broken_write {
            return;
        }
        let Some(writer) = self.writer.as_mut() else {
            tracing::warn!(stream = %self.label, "dropped write, stream already closed");
            return;
        };
        if let Err(error) = writer.write_all(bytes).await {
            tracing::warn!(stream = %self.label, %error, "dropped write, peer gone");
            self.broken_write = true;
            self.writer = None;
        }
    }

    /// Shuts down the write half, signalling end of output to the peer
    /// while the read half keeps draining.
    pub async fn half_close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(error) = writer.shutdown().await {
                tracing::debug!(stream = %self.label, %error, "shutdown failed");
            }
        }
    }

    /// Drops both halves.
    pub async fn close(&mut self) {
        self.half_close().await;
        self.reader = None;
        self.eof = true;
    }
}

impl<R, W> std::fmt::Debug for PktStream<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PktStream")
            .field("label", &self.label)
            .field("paused", &self.paused)
            .field("eof", &self.eof)
            .field("queued", &self.queued.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pkt(payload: &[u8]) -> Vec<u8> {
        frame::encode(payload).to_vec()
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (client, server) = duplex(4096);
        let (_read, mut write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let mut stream = PktStream::boxed(server_read, server_write);
        stream.set_sideband(false);

        write.write_all(&pkt(b"one\n")).await.unwrap();
        write.write_all(&pkt(b"two\n")).await.unwrap();
        write.write_all(frame::FLUSH_BYTES).await.unwrap();

        assert_eq!(
            stream.next_event().await.unwrap(),
            StreamEvent::Frame(Frame::new(Bytes::from_static(b"one\n")))
        );
        assert_eq!(
            stream.next_event().await.unwrap(),
            StreamEvent::Frame(Frame::new(Bytes::from_static(b"two\n")))
        );
        assert_eq!(stream.next_event().await.unwrap(), StreamEvent::Frame(Frame::flush()));
    }

    #[tokio::test]
    async fn test_pause_holds_events_and_resume_replays_in_order() {
        let (client, server) = duplex(4096);
        let (read, mut write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let mut stream = PktStream::boxed(server_read, server_write);
        stream.set_sideband(false);

        write.write_all(&pkt(b"a")).await.unwrap();
        write.write_all(&pkt(b"b")).await.unwrap();

        // Decode everything available, then pause before consuming.
        let first = stream.next_event().await.unwrap();
        assert_eq!(first, StreamEvent::Frame(Frame::new(Bytes::from_static(b"a"))));
        stream.pause();
        assert!(stream.is_paused());

        write.write_all(&pkt(b"c")).await.unwrap();
        drop(write);
        drop(read);

        stream.resume();
        assert_eq!(
            stream.next_event().await.unwrap(),
            StreamEvent::Frame(Frame::new(Bytes::from_static(b"b")))
        );
        assert_eq!(
            stream.next_event().await.unwrap(),
            StreamEvent::Frame(Frame::new(Bytes::from_static(b"c")))
        );
        assert_eq!(stream.next_event().await.unwrap(), StreamEvent::Closed);
        assert_eq!(stream.next_event().await.unwrap(), StreamEvent::Closed);
    }

    #[tokio::test]
    async fn test_send_after_peer_gone_is_silent() {
        let (client, server) = duplex(64);
        let (server_read, server_write) = tokio::io::split(server);
        let mut stream = PktStream::boxed(server_read, server_write);
        drop(client);

        // Neither call may error or panic.
        stream.send(b"hello").await;
        stream.send_flush().await;
        stream.send_band(Band::Progress, b"still here\n").await;
    }

    #[tokio::test]
    async fn test_sideband_classification() {
        let (client, server) = duplex(4096);
        let (_read, mut write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let mut stream = PktStream::boxed(server_read, server_write);

        let mut framed = vec![2u8];
        framed.extend_from_slice(b"Counting objects\n");
        write.write_all(&pkt(&framed)).await.unwrap();

        let event = stream.next_event().await.unwrap();
        assert!(matches!(event, StreamEvent::Frame(_)));
        assert_eq!(
            stream.next_event().await.unwrap(),
            StreamEvent::Band(Band::Progress, Bytes::from_static(b"Counting objects\n"))
        );
    }

    #[tokio::test]
    async fn test_half_close_signals_peer_eof() {
        let (client, server) = duplex(4096);
        let (mut read, _write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let mut stream = PktStream::boxed(server_read, server_write);

        stream.send(b"bye").await;
        stream.half_close().await;

        let mut collected = Vec::new();
        read.read_to_end(&mut collected).await.unwrap();
        assert_eq!(collected, pkt(b"bye"));
    }
}
