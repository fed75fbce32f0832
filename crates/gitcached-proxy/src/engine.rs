//! Per-connection negotiation state machine.
//!
//! One [`ConnectionEngine`] owns one client connection from accept to
//! teardown. The lifecycle is a straight-line sequence of phases, each
//! driven by one async method; every transition happens in
//! [`ConnectionEngine::lifecycle`], so there is exactly one place to
//! read the whole protocol flow.
//!
//! The client speaks the git daemon protocol to us; we speak it onward
//! to the upstream server and, over pipes, to a local pack transmitter
//! serving from the mirror. All three conversations go through
//! [`DynPktStream`], so the phase drivers never care which kind of
//! peer they are facing.

use std::sync::Arc;

use futures::FutureExt;
use gitcached_proc::{retry, Backoff, RetryOutcome};
use gitcached_wire::{Band, DynPktStream, Frame, PktStream, StreamEvent};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::error::{ProxyError, Result};
use crate::git::{PackIngest, Toolchain};
use crate::lines::LineSplitter;
use crate::refs;
use crate::request::{self, Request};
use crate::types::{CacheState, ObjectId, ServerLink};

/// Lifecycle phase, exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingRequestLine,
    ConnectingUpstream,
    ReadingUpstreamPreamble,
    ReadingClientWants,
    SendingUpstreamWants,
    NegotiatingHaves,
    ReceivingPack,
    UpdatingRefs,
    SendingPack,
    AwaitingClientClose,
    CleaningKeepFiles,
    CleaningRefs,
    Completed,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::AwaitingRequestLine => "awaiting request line",
            Phase::ConnectingUpstream => "connecting upstream",
            Phase::ReadingUpstreamPreamble => "reading upstream preamble",
            Phase::ReadingClientWants => "reading client wants",
            Phase::SendingUpstreamWants => "sending upstream wants",
            Phase::NegotiatingHaves => "negotiating haves",
            Phase::ReceivingPack => "receiving pack",
            Phase::UpdatingRefs => "updating refs",
            Phase::SendingPack => "sending pack",
            Phase::AwaitingClientClose => "awaiting client close",
            Phase::CleaningKeepFiles => "cleaning keep files",
            Phase::CleaningRefs => "cleaning refs",
            Phase::Completed => "completed",
        }
    }
}

/// Shared phase cell, readable from the server's diagnostics dump.
pub type PhaseCell = Arc<parking_lot::Mutex<Phase>>;

/// Sideband capabilities requested from upstream on the first want.
const UPSTREAM_WANT_CAPS: &str = " side-band side-band-64k";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Port used when the request names a host without one.
    pub default_port: u16,
    /// Upper bound on have lines offered to upstream.
    pub have_limit: usize,
    /// Policy for the one retried operation, the upstream connect.
    pub connect_backoff: Backoff,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_port: 9418,
            have_limit: 1024,
            connect_backoff: Backoff::default(),
        }
    }
}

/// Opens the upstream connection. A seam so tests can script the
/// upstream side without sockets.
#[async_trait::async_trait]
pub trait Dial: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<DynPktStream>;
}

pub struct TcpDial;

#[async_trait::async_trait]
impl Dial for TcpDial {
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<DynPktStream> {
        let socket = TcpStream::connect((host, port)).await?;
        let (read, write) = socket.into_split();
        Ok(PktStream::boxed(read, write).with_label(format!("upstream {host}:{port}")))
    }
}

enum Reply {
    Nak,
    Ack(ObjectId),
}

pub struct ConnectionEngine {
    id: String,
    toolchain: Arc<dyn Toolchain>,
    dial: Arc<dyn Dial>,
    config: EngineConfig,
    phase: PhaseCell,
    /// Ids the client asked for, unique, in arrival order. Arrival
    /// order is preserved for replay to the local pack transmitter.
    wants: Vec<ObjectId>,
    /// Wants not already present in the mirror, in want order.
    forward: Vec<ObjectId>,
    client_caps: Vec<String>,
    /// Upstream diagnostic lines captured during ingest, replayed to
    /// the client once it can receive sideband data.
    backlog: Vec<String>,
    backlog_replayed: bool,
    acked: bool,
}

impl ConnectionEngine {
    pub fn new(
        id: String,
        toolchain: Arc<dyn Toolchain>,
        dial: Arc<dyn Dial>,
        config: EngineConfig,
        phase: PhaseCell,
    ) -> Self {
        Self {
            id,
            toolchain,
            dial,
            config,
            phase,
            wants: Vec::new(),
            forward: Vec::new(),
            client_caps: Vec::new(),
            backlog: Vec::new(),
            backlog_replayed: false,
            acked: false,
        }
    }

    fn set_phase(&self, phase: Phase) {
        tracing::debug!(connection = %self.id, phase = phase.label(), "phase");
        *self.phase.lock() = phase;
    }

    /// Final cache classification, valid once the lifecycle is over.
    fn classification(&self) -> CacheState {
        if self.wants.is_empty() {
            CacheState::NoObjects
        } else if self.forward.is_empty() {
            CacheState::Hot
        } else if self.acked {
            CacheState::Warm
        } else {
            CacheState::Cold
        }
    }

    /// Drives the connection to completion. On a fatal error the
    /// client gets a best-effort `ERR` frame and both links go down;
    /// housekeeping still runs so no markers or refs leak.
    pub async fn run(mut self, mut client: DynPktStream) -> Result<CacheState> {
        client.set_sideband(false);
        match self.lifecycle(&mut client).await {
            Ok(state) => {
                client.close().await;
                Ok(state)
            }
            Err(error) => {
                client
                    .send(format!("ERR {}\n", error.client_message()).as_bytes())
                    .await;
                client.close().await;
                self.housekeeping().await;
                Err(error)
            }
        }
    }

    async fn lifecycle(&mut self, client: &mut DynPktStream) -> Result<CacheState> {
        self.set_phase(Phase::AwaitingRequestLine);
        let request = self.await_request(client).await?;

        self.set_phase(Phase::ConnectingUpstream);
        let mut server = self.connect_upstream(&request).await?;
        server.send(request.upstream_line().as_bytes()).await;
        let mut link = ServerLink::new(request.host, request.port, request.repo);
        tracing::info!(connection = %self.id, upstream = %link.label(), "proxying");

        self.set_phase(Phase::ReadingUpstreamPreamble);
        self.read_preamble(client, &mut server, &mut link).await?;

        self.set_phase(Phase::ReadingClientWants);
        self.read_client_wants(client).await?;
        if self.wants.is_empty() {
            // Advertisement-only session (ls-remote and friends).
            server.close().await;
            client.half_close().await;
            self.housekeeping().await;
            self.set_phase(Phase::Completed);
            return Ok(self.classification());
        }

        self.set_phase(Phase::SendingUpstreamWants);
        if self.forward.is_empty() {
            // Fully served from the mirror; upstream owes us nothing.
            server.close().await;
        } else {
            self.send_upstream_wants(&mut server).await;

            self.set_phase(Phase::NegotiatingHaves);
            self.negotiate_haves(&mut server).await?;

            self.set_phase(Phase::ReceivingPack);
            let host = link.host.clone();
            self.receive_pack(&mut server, &host).await?;
            server.close().await;
        }

        self.set_phase(Phase::UpdatingRefs);
        self.update_refs(&link).await;

        self.set_phase(Phase::SendingPack);
        self.send_pack(client).await?;

        self.set_phase(Phase::AwaitingClientClose);
        self.await_client_close(client).await?;

        self.housekeeping().await;
        self.set_phase(Phase::Completed);
        Ok(self.classification())
    }

    async fn await_request(&mut self, client: &mut DynPktStream) -> Result<Request> {
        match client.next_event().await? {
            StreamEvent::Frame(frame) if !frame.is_flush() => {
                request::parse(frame.payload(), self.config.default_port)
            }
            StreamEvent::Frame(_) => Err(ProxyError::Protocol(String::from(
                "flush before any request line",
            ))),
            StreamEvent::Closed => Err(ProxyError::Transport(String::from(
                "client closed before sending a request",
            ))),
            StreamEvent::Band(..) => Err(ProxyError::Protocol(String::from(
                "unexpected sideband data from client",
            ))),
        }
    }

    async fn connect_upstream(&mut self, request: &Request) -> Result<DynPktStream> {
        let dial = Arc::clone(&self.dial);
        retry(
            self.config.connect_backoff,
            "upstream connect",
            || dial.dial(&request.host, request.port),
            |_| RetryOutcome::Retry(2.0),
        )
        .await
        .map_err(|error| {
            ProxyError::Transport(format!(
                "could not reach {}:{}: {}",
                request.host,
                request.port,
                error.into_inner()
            ))
        })
    }

    /// Reads the upstream ref advertisement until flush, recording
    /// every ref and forwarding each line to the client untouched.
    /// The first line keeps its capability list on the wire; the list
    /// is stripped only for matching.
    async fn read_preamble(
        &mut self,
        client: &mut DynPktStream,
        server: &mut DynPktStream,
        link: &mut ServerLink,
    ) -> Result<()> {
        let mut first = true;
        loop {
            let frame = match server.next_event().await? {
                StreamEvent::Frame(frame) => frame,
                StreamEvent::Band(..) => continue,
                StreamEvent::Closed => {
                    return Err(ProxyError::Upstream(String::from(
                        "upstream closed during ref advertisement",
                    )))
                }
            };
            if frame.is_flush() {
                client.send_flush().await;
                return Ok(());
            }
            let text = String::from_utf8_lossy(frame.payload());
            if let Some(message) = text.strip_prefix("ERR ") {
                return Err(ProxyError::Upstream(message.trim().to_owned()));
            }
            let line = match text.split_once('\0') {
                Some((line, caps)) if first => {
                    link.capabilities = caps
                        .trim_end()
                        .split(' ')
                        .filter(|c| !c.is_empty())
                        .map(str::to_owned)
                        .collect();
                    line.to_owned()
                }
                Some((line, _)) => line.to_owned(),
                None => text.trim_end_matches('\n').to_owned(),
            };
            first = false;
            let (id, name) = line
                .trim_end()
                .split_once(' ')
                .ok_or_else(|| ProxyError::Protocol(format!("bad advertisement line {line:?}")))?;
            link.record_ref(ObjectId::parse(id)?, name.to_owned());
            client.send(frame.payload()).await;
        }
    }

    /// Reads want lines until flush, overlapping a mirror presence
    /// lookup per distinct id with the remaining reads, then joins all
    /// lookups before deciding what to forward.
    async fn read_client_wants(&mut self, client: &mut DynPktStream) -> Result<()> {
        let mut lookups: Vec<(ObjectId, oneshot::Receiver<bool>)> = Vec::new();
        loop {
            match client.next_event().await? {
                StreamEvent::Frame(frame) if frame.is_flush() => break,
                StreamEvent::Frame(frame) => {
                    let text = String::from_utf8_lossy(frame.payload());
                    let line = text.trim_end();
                    let rest = line.strip_prefix("want ").ok_or_else(|| {
                        ProxyError::Protocol(format!("expected a want line, got {line:?}"))
                    })?;
                    let mut tokens = rest.split(' ').filter(|t| !t.is_empty());
                    let id = ObjectId::parse(tokens.next().unwrap_or_default())?;
                    if self.client_caps.is_empty() {
                        self.client_caps = tokens.map(str::to_owned).collect();
                    }
                    if !self.wants.contains(&id) {
                        let lookup = self.toolchain.lookup_object(&id);
                        self.wants.push(id.clone());
                        lookups.push((id, lookup));
                    }
                }
                StreamEvent::Closed if self.wants.is_empty() && lookups.is_empty() => {
                    // Client hung up right after the advertisement.
                    return Ok(());
                }
                StreamEvent::Closed => {
                    return Err(ProxyError::Transport(String::from(
                        "client closed mid-request",
                    )))
                }
                StreamEvent::Band(..) => {}
            }
        }
        // Join point: no forwarding decision until every lookup is in.
        client.pause();
        for (id, lookup) in lookups {
            let present = lookup.await.unwrap_or(false);
            if present {
                tracing::debug!(connection = %self.id, %id, "already in mirror");
            } else {
                self.forward.push(id);
            }
        }
        client.resume();
        Ok(())
    }

    async fn send_upstream_wants(&mut self, server: &mut DynPktStream) {
        for (index, id) in self.forward.iter().enumerate() {
            let line = if index == 0 {
                format!("want {id}{UPSTREAM_WANT_CAPS}\n")
            } else {
                format!("want {id}\n")
            };
            server.send(line.as_bytes()).await;
        }
        server.send_flush().await;
    }

    /// Offers cached commits as haves, newest first, watching for an
    /// early `ACK` between sends. Ends with `done` either way.
    async fn negotiate_haves(&mut self, server: &mut DynPktStream) -> Result<()> {
        let haves = self
            .toolchain
            .recent_persistent_commits(self.config.have_limit)
            .await?;
        tracing::debug!(connection = %self.id, count = haves.len(), "offering cached haves");
        'offer: for id in &haves {
            server.send(format!("have {id}\n").as_bytes()).await;
            while let Some(event) = server.next_event().now_or_never() {
                match parse_reply(&frame_of(event?)?)? {
                    Reply::Nak => {}
                    Reply::Ack(ack) => {
                        tracing::debug!(connection = %self.id, id = %ack, "upstream ack");
                        self.acked = true;
                        break 'offer;
                    }
                }
            }
        }
        server.send(b"done\n").await;
        Ok(())
    }

    /// Splices upstream sideband channels into the indexer: channel 1
    /// feeds the pack, channel 2 is captured for later replay, channel
    /// 3 is fatal. Late `ACK`/`NAK` replies are still honoured here.
    async fn receive_pack(&mut self, server: &mut DynPktStream, host: &str) -> Result<()> {
        let mut ingest = self.toolchain.start_pack_ingest(&self.id).await?;
        let mut splitter = LineSplitter::new();
        let mut upstream_open = true;
        let mut progress_open = true;

        enum Ev {
            Upstream(StreamEvent),
            Progress(Option<String>),
            Done(std::result::Result<bool, oneshot::error::RecvError>),
        }

        loop {
            let ev = tokio::select! {
                event = server.next_event(), if upstream_open => Ev::Upstream(event?),
                line = ingest.progress.recv(), if progress_open => Ev::Progress(line),
                result = &mut ingest.done => Ev::Done(result),
            };
            match ev {
                Ev::Upstream(StreamEvent::Band(Band::Pack, bytes)) => {
                    if let Err(error) = ingest.input.write_all(&bytes).await {
                        return Err(ProxyError::Subprocess(format!(
                            "index-pack rejected pack data: {error}"
                        )));
                    }
                }
                Ev::Upstream(StreamEvent::Band(Band::Progress, bytes)) => {
                    for line in splitter.push(&bytes) {
                        self.backlog.push(format!("{host}: {line}"));
                    }
                }
                Ev::Upstream(StreamEvent::Band(Band::Error, bytes)) => {
                    return Err(ProxyError::Upstream(
                        String::from_utf8_lossy(&bytes).trim().to_owned(),
                    ));
                }
                Ev::Upstream(StreamEvent::Frame(frame)) => {
                    if frame.band().is_none() && !frame.is_flush() {
                        if let Reply::Ack(_) = parse_reply(&frame)? {
                            self.acked = true;
                        }
                    }
                }
                Ev::Upstream(StreamEvent::Closed) => {
                    upstream_open = false;
                    let _ = ingest.input.shutdown().await;
                }
                Ev::Progress(Some(line)) => self.backlog.push(format!("{host}: {line}")),
                Ev::Progress(None) => progress_open = false,
                Ev::Done(result) => {
                    drain_progress(&mut ingest, host, &mut self.backlog);
                    if let Some(line) = splitter.finish() {
                        self.backlog.push(format!("{host}: {line}"));
                    }
                    return if matches!(result, Ok(true)) {
                        Ok(())
                    } else {
                        Err(ProxyError::Subprocess(String::from("index-pack failed")))
                    };
                }
            }
        }
    }

    /// Records every fetched want under both ref namespaces, joining
    /// all updates before moving on. Failures are local-state noise,
    /// never fatal.
    async fn update_refs(&mut self, link: &ServerLink) {
        let mut pending = Vec::new();
        for id in &self.wants {
            let Some(name) = link.ref_name_for(id) else {
                tracing::warn!(connection = %self.id, %id, "want was never advertised, no ref to record");
                continue;
            };
            let private = refs::in_progress_ref(&self.id, name);
            let shared = refs::persistent_ref(&link.host, &link.repo, name);
            pending.push((private.clone(), self.toolchain.update_ref(&private, id)));
            pending.push((shared.clone(), self.toolchain.update_ref(&shared, id)));
        }
        for (name, update) in pending {
            if !update.await.unwrap_or(false) {
                tracing::warn!(connection = %self.id, r#ref = %name, "ref update failed");
            }
        }
    }

    /// Serves the pack to the client from the mirror: discard the
    /// local transmitter's advertisement, replay the full original
    /// want set with the client's own capabilities, then splice both
    /// directions until the transmitter exits.
    async fn send_pack(&mut self, client: &mut DynPktStream) -> Result<()> {
        let mut session = self.toolchain.start_pack_send().await?;
        loop {
            match session.stream.next_event().await? {
                StreamEvent::Frame(frame) if frame.is_flush() => break,
                StreamEvent::Frame(_) | StreamEvent::Band(..) => {}
                StreamEvent::Closed => {
                    return Err(ProxyError::Subprocess(String::from(
                        "pack transmitter exited during its advertisement",
                    )))
                }
            }
        }
        for (index, id) in self.wants.iter().enumerate() {
            let line = if index == 0 && !self.client_caps.is_empty() {
                format!("want {id} {}", self.client_caps.join(" "))
            } else {
                format!("want {id}")
            };
            session.stream.send(line.as_bytes()).await;
        }
        session.stream.send_flush().await;

        let mut task_open = true;
        let mut client_open = true;

        enum Ev {
            Task(StreamEvent),
            Client(StreamEvent),
            Done(std::result::Result<bool, oneshot::error::RecvError>),
        }

        loop {
            let ev = tokio::select! {
                event = session.stream.next_event(), if task_open => Ev::Task(event?),
                event = client.next_event(), if client_open => Ev::Client(event?),
                result = &mut session.done => Ev::Done(result),
            };
            match ev {
                Ev::Task(StreamEvent::Frame(frame)) => {
                    self.forward_to_client(client, &frame).await?;
                }
                Ev::Task(StreamEvent::Band(..)) => {}
                Ev::Task(StreamEvent::Closed) => task_open = false,
                Ev::Client(StreamEvent::Frame(frame)) => {
                    if frame.is_flush() {
                        session.stream.send_flush().await;
                    } else {
                        session.stream.send(frame.payload()).await;
                    }
                }
                Ev::Client(StreamEvent::Band(..)) => {}
                Ev::Client(StreamEvent::Closed) => {
                    client_open = false;
                    session.stream.half_close().await;
                }
                Ev::Done(result) => {
                    if !matches!(result, Ok(true)) {
                        return Err(ProxyError::Subprocess(String::from("upload-pack failed")));
                    }
                    break;
                }
            }
        }
        // The transmitter exited; its last buffered output may still be
        // in the pipe.
        while task_open {
            match session.stream.next_event().await? {
                StreamEvent::Frame(frame) => self.forward_to_client(client, &frame).await?,
                StreamEvent::Band(..) => {}
                StreamEvent::Closed => task_open = false,
            }
        }
        client.half_close().await;
        Ok(())
    }

    /// One frame of transmitter output, client-bound. Channel 1 and
    /// unclassified frames pass through verbatim; the first channel-2
    /// frame opens the gate for the buffered upstream backlog.
    async fn forward_to_client(&mut self, client: &mut DynPktStream, frame: &Frame) -> Result<()> {
        if frame.is_flush() {
            client.send_flush().await;
            return Ok(());
        }
        match frame.band() {
            Some(Band::Progress) => {
                if !self.backlog_replayed {
                    self.backlog_replayed = true;
                    for line in self.backlog.drain(..) {
                        let labelled = format!("proxy: {line}\n");
                        client.send_band(Band::Progress, labelled.as_bytes()).await;
                    }
                }
                let mut labelled = b"proxy: ".to_vec();
                labelled.extend_from_slice(&frame.band_payload());
                client.send_band(Band::Progress, &labelled).await;
            }
            Some(Band::Error) => {
                client.send(frame.payload()).await;
                return Err(ProxyError::Subprocess(format!(
                    "pack transmitter error: {}",
                    String::from_utf8_lossy(&frame.band_payload()).trim()
                )));
            }
            Some(Band::Pack) | None => client.send(frame.payload()).await,
        }
        Ok(())
    }

    async fn await_client_close(&mut self, client: &mut DynPktStream) -> Result<()> {
        loop {
            match client.next_event().await? {
                StreamEvent::Closed => return Ok(()),
                StreamEvent::Frame(_) | StreamEvent::Band(..) => {}
            }
        }
    }

    /// Phases 11 and 12: remove this connection's keep markers and its
    /// in-progress ref subtree. Runs on success and on abort.
    async fn housekeeping(&mut self) {
        self.set_phase(Phase::CleaningKeepFiles);
        match self.toolchain.cleanup_keep_files(&self.id).await {
            Ok(removed) if removed > 0 => {
                tracing::debug!(connection = %self.id, removed, "keep markers removed");
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(connection = %self.id, %error, "keep marker cleanup failed");
            }
        }

        self.set_phase(Phase::CleaningRefs);
        let prefix = refs::in_progress_prefix(&self.id);
        match self.toolchain.list_refs(&prefix).await {
            Ok(names) => {
                for name in names {
                    if let Err(error) = self.toolchain.delete_ref(&name).await {
                        tracing::warn!(connection = %self.id, r#ref = %name, %error, "ref not deleted");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(connection = %self.id, %error, "in-progress refs not enumerated");
            }
        }
        self.toolchain.prune_ref_dirs(&self.id).await;
    }
}

fn frame_of(event: StreamEvent) -> Result<Frame> {
    match event {
        StreamEvent::Frame(frame) => Ok(frame),
        StreamEvent::Band(band, _) => Err(ProxyError::Upstream(format!(
            "unexpected sideband {band:?} data during negotiation"
        ))),
        StreamEvent::Closed => Err(ProxyError::Upstream(String::from(
            "upstream closed during negotiation",
        ))),
    }
}

fn parse_reply(frame: &Frame) -> Result<Reply> {
    let text = String::from_utf8_lossy(frame.payload());
    let line = text.trim_end();
    if line == "NAK" {
        return Ok(Reply::Nak);
    }
    if let Some(id) = line.strip_prefix("ACK ") {
        let id = id.split(' ').next().unwrap_or_default();
        return Ok(Reply::Ack(ObjectId::parse(id)?));
    }
    Err(ProxyError::Upstream(format!(
        "unexpected negotiation reply {line:?}"
    )))
}

fn drain_progress(ingest: &mut PackIngest, host: &str, backlog: &mut Vec<String>) {
    while let Ok(line) = ingest.progress.try_recv() {
        backlog.push(format!("{host}: {line}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_variants() {
        let ack = Frame::new(bytes::Bytes::from(format!("ACK {}\n", "a".repeat(40))));
        assert!(matches!(parse_reply(&ack), Ok(Reply::Ack(_))));

        let mixed = Frame::new(bytes::Bytes::from(format!("ACK ABC123{}\n", "0".repeat(34))));
        assert!(matches!(parse_reply(&mixed), Ok(Reply::Ack(_))));

        let nak = Frame::new(bytes::Bytes::from_static(b"NAK\n"));
        assert!(matches!(parse_reply(&nak), Ok(Reply::Nak)));

        let junk = Frame::new(bytes::Bytes::from_static(b"shallow deadbeef\n"));
        assert!(parse_reply(&junk).is_err());
    }

    #[test]
    fn test_phase_labels_are_distinct() {
        let phases = [
            Phase::AwaitingRequestLine,
            Phase::ConnectingUpstream,
            Phase::ReadingUpstreamPreamble,
            Phase::ReadingClientWants,
            Phase::SendingUpstreamWants,
            Phase::NegotiatingHaves,
            Phase::ReceivingPack,
            Phase::UpdatingRefs,
            Phase::SendingPack,
            Phase::AwaitingClientClose,
            Phase::CleaningKeepFiles,
            Phase::CleaningRefs,
            Phase::Completed,
        ];
        let labels: std::collections::HashSet<_> = phases.iter().map(|p| p.label()).collect();
        assert_eq!(labels.len(), phases.len());
    }
}
