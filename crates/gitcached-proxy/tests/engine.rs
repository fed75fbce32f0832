//! Full-lifecycle tests against an in-memory upstream and a scripted
//! toolchain. No git binary and no sockets.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gitcached_proc::Backoff;
use gitcached_proxy::engine::{ConnectionEngine, Dial, EngineConfig, Phase};
use gitcached_proxy::git::{PackIngest, PackSession, Toolchain};
use gitcached_proxy::{CacheState, ObjectId, ProxyError};
use gitcached_wire::{Band, DynPktStream, PktStream, StreamEvent};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};

const CONN_ID: &str = "test-conn";

fn oid(c: char) -> ObjectId {
    ObjectId::parse(&c.to_string().repeat(40)).unwrap()
}

/// Toolchain with canned answers that records everything it is asked
/// to do.
#[derive(Default)]
struct ScriptedToolchain {
    present: HashSet<ObjectId>,
    haves: Vec<ObjectId>,
    updated: Arc<Mutex<Vec<(String, ObjectId)>>>,
    deleted: Arc<Mutex<Vec<String>>>,
    keep_cleanups: Arc<Mutex<Vec<String>>>,
    replayed_wants: Arc<Mutex<Vec<String>>>,
    ingested: Arc<Mutex<Vec<u8>>>,
    pack_sessions: Arc<Mutex<usize>>,
}

#[async_trait]
impl Toolchain for ScriptedToolchain {
    fn lookup_object(&self, id: &ObjectId) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(self.present.contains(id));
        rx
    }

    async fn recent_persistent_commits(
        &self,
        limit: usize,
    ) -> gitcached_proxy::Result<Vec<ObjectId>> {
        Ok(self.haves.iter().take(limit).cloned().collect())
    }

    async fn start_pack_ingest(&self, _keep_tag: &str) -> gitcached_proxy::Result<PackIngest> {
        let (ours, theirs) = tokio::io::duplex(1 << 16);
        let (line_tx, progress) = mpsc::unbounded_channel();
        let _ = line_tx.send(String::from("Resolving deltas: 100%"));
        drop(line_tx);
        let (done_tx, done) = oneshot::channel();
        let ingested = Arc::clone(&self.ingested);
        tokio::spawn(async move {
            let mut reader = theirs;
            let mut all = Vec::new();
            let _ = reader.read_to_end(&mut all).await;
            ingested.lock().extend_from_slice(&all);
            let _ = done_tx.send(true);
        });
        Ok(PackIngest {
            input: Box::new(ours),
            progress,
            done,
        })
    }

    async fn start_pack_send(&self) -> gitcached_proxy::Result<PackSession> {
        *self.pack_sessions.lock() += 1;
        let (ours, theirs) = tokio::io::duplex(1 << 16);
        let (read, write) = tokio::io::split(theirs);
        let mut side = PktStream::boxed(read, write);
        side.set_sideband(false);
        let replayed = Arc::clone(&self.replayed_wants);
        let (done_tx, done) = oneshot::channel();
        tokio::spawn(async move {
            // Advertisement the engine discards.
            side.send(format!("{} HEAD\0side-band-64k\n", "0".repeat(40)).as_bytes())
                .await;
            side.send_flush().await;
            loop {
                match side.next_event().await.unwrap() {
                    StreamEvent::Frame(frame) if frame.is_flush() => break,
                    StreamEvent::Frame(frame) => {
                        let line = String::from_utf8_lossy(frame.payload())
                            .trim_end()
                            .to_owned();
                        replayed.lock().push(line);
                    }
                    StreamEvent::Band(..) => {}
                    StreamEvent::Closed => return,
                }
            }
            side.send(b"NAK\n").await;
            side.send_band(Band::Progress, b"Compressing objects\n").await;
            side.send_band(Band::Pack, b"PACKDATA").await;
            side.half_close().await;
            let _ = done_tx.send(true);
        });
        let (read, write) = tokio::io::split(ours);
        Ok(PackSession {
            stream: PktStream::boxed(read, write),
            done,
        })
    }

    fn update_ref(&self, name: &str, id: &ObjectId) -> oneshot::Receiver<bool> {
        self.updated.lock().push((name.to_owned(), id.clone()));
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(true);
        rx
    }

    async fn list_refs(&self, prefix: &str) -> gitcached_proxy::Result<Vec<String>> {
        Ok(self
            .updated
            .lock()
            .iter()
            .map(|(name, _)| name.clone())
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    async fn delete_ref(&self, name: &str) -> gitcached_proxy::Result<()> {
        self.deleted.lock().push(name.to_owned());
        Ok(())
    }

    async fn cleanup_keep_files(&self, keep_tag: &str) -> gitcached_proxy::Result<usize> {
        self.keep_cleanups.lock().push(keep_tag.to_owned());
        Ok(1)
    }

    async fn prune_ref_dirs(&self, _connection_id: &str) {}
}

/// Hands out pre-built upstream streams; most tests use exactly one.
#[derive(Default)]
struct ScriptedDial {
    streams: Mutex<Vec<DynPktStream>>,
}

impl ScriptedDial {
    fn with(stream: DynPktStream) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(vec![stream]),
        })
    }
}

#[async_trait]
impl Dial for ScriptedDial {
    async fn dial(&self, _host: &str, _port: u16) -> io::Result<DynPktStream> {
        self.streams
            .lock()
            .pop()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "scripted refusal"))
    }
}

/// What the scripted upstream observed.
#[derive(Default)]
struct UpstreamLog {
    request: Mutex<String>,
    wants: Mutex<Vec<String>>,
    haves: Mutex<Vec<String>>,
}

/// Spawns an upstream that advertises `advertised`, ACKs the first
/// have if `ack`, then sends a small sidebanded pack.
fn scripted_upstream(advertised: Vec<(ObjectId, String)>, ack: bool) -> (DynPktStream, Arc<UpstreamLog>) {
    let (ours, theirs) = tokio::io::duplex(1 << 16);
    let log = Arc::new(UpstreamLog::default());
    let observed = Arc::clone(&log);
    let (read, write) = tokio::io::split(theirs);
    let mut side = PktStream::boxed(read, write);
    side.set_sideband(false);
    tokio::spawn(async move {
        // Request line.
        match side.next_event().await.unwrap() {
            StreamEvent::Frame(frame) => {
                *observed.request.lock() =
                    String::from_utf8_lossy(frame.payload()).into_owned();
            }
            _ => return,
        }
        // Advertisement; capability list rides the first line.
        for (index, (id, name)) in advertised.iter().enumerate() {
            let line = if index == 0 {
                format!("{id} {name}\0side-band side-band-64k\n")
            } else {
                format!("{id} {name}\n")
            };
            side.send(line.as_bytes()).await;
        }
        side.send_flush().await;
        // Wants until flush. A fully cached client closes instead.
        loop {
            match side.next_event().await.unwrap() {
                StreamEvent::Frame(frame) if frame.is_flush() => break,
                StreamEvent::Frame(frame) => {
                    let line = String::from_utf8_lossy(frame.payload())
                        .trim_end()
                        .to_owned();
                    observed.wants.lock().push(line);
                }
                StreamEvent::Band(..) => {}
                StreamEvent::Closed => return,
            }
        }
        // Haves until done.
        let mut acked = false;
        loop {
            let frame = match side.next_event().await.unwrap() {
                StreamEvent::Frame(frame) => frame,
                StreamEvent::Band(..) => continue,
                StreamEvent::Closed => return,
            };
            let line = String::from_utf8_lossy(frame.payload())
                .trim_end()
                .to_owned();
            if line == "done" {
                break;
            }
            if let Some(id) = line.strip_prefix("have ") {
                let id = id.to_owned();
                observed.haves.lock().push(id.clone());
                if ack && !acked {
                    acked = true;
                    side.send(format!("ACK {id}\n").as_bytes()).await;
                } else {
                    side.send(b"NAK\n").await;
                }
            }
        }
        if !acked {
            side.send(b"NAK\n").await;
        }
        side.send_band(Band::Progress, b"Counting objects: 1\n").await;
        side.send_band(Band::Pack, b"UPSTREAMPACK").await;
        side.close().await;
    });
    let (read, write) = tokio::io::split(ours);
    (PktStream::boxed(read, write), log)
}

fn engine_with(toolchain: Arc<ScriptedToolchain>, dial: Arc<dyn Dial>) -> ConnectionEngine {
    ConnectionEngine::new(
        CONN_ID.to_owned(),
        toolchain,
        dial,
        EngineConfig::default(),
        Arc::new(Mutex::new(Phase::AwaitingRequestLine)),
    )
}

/// Client-side stream pair: what the test drives, what the engine gets.
fn client_pair() -> (DynPktStream, DynPktStream) {
    let (a, b) = tokio::io::duplex(1 << 16);
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    (PktStream::boxed(ar, aw), PktStream::boxed(br, bw))
}

async fn collect_until_closed(client: &mut DynPktStream) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        let event = client.next_event().await.unwrap();
        let closed = event == StreamEvent::Closed;
        events.push(event);
        if closed {
            return events;
        }
    }
}

fn band_payloads(events: &[StreamEvent], band: Band) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Band(b, payload) if *b == band => Some(payload.to_vec()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_warm_fetch_end_to_end() {
    let head = oid('a');
    let cached = oid('b');
    let (upstream, log) = scripted_upstream(
        vec![(head.clone(), String::from("refs/heads/main"))],
        true,
    );
    let toolchain = Arc::new(ScriptedToolchain {
        haves: vec![cached.clone()],
        ..ScriptedToolchain::default()
    });
    let (mut client, engine_side) = client_pair();
    let engine = engine_with(Arc::clone(&toolchain), ScriptedDial::with(upstream));
    let run = tokio::spawn(engine.run(engine_side));

    client
        .send(b"git-upload-pack /r.git\0host=h.example\0")
        .await;
    client.send(format!("want {head}\n").as_bytes()).await;
    client.send_flush().await;
    let events = collect_until_closed(&mut client).await;
    client.close().await;

    let state = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(state, CacheState::Warm);

    // The want went upstream, with the sideband extension.
    assert_eq!(
        *log.wants.lock(),
        vec![format!("want {head} side-band side-band-64k")]
    );
    assert_eq!(*log.haves.lock(), vec![cached.as_str().to_owned()]);

    // The upstream pack landed in the indexer.
    assert_eq!(*toolchain.ingested.lock(), b"UPSTREAMPACK");

    // Both namespaces were updated for the fetched ref.
    let updated = toolchain.updated.lock();
    assert!(updated.contains(&(
        String::from("refs/persistent/h.example/r.git/refs/heads/main"),
        head.clone()
    )));
    assert!(updated.contains(&(
        format!("refs/in-progress/{CONN_ID}/refs/heads/main"),
        head.clone()
    )));
    drop(updated);

    // The client saw the advertisement, the local pack, and the
    // backlog replayed with the proxy prefix.
    let first = events.iter().find_map(|event| match event {
        StreamEvent::Frame(frame) if !frame.is_flush() => Some(frame.payload().to_vec()),
        _ => None,
    });
    assert_eq!(
        first.unwrap(),
        format!("{head} refs/heads/main\0side-band side-band-64k\n").into_bytes()
    );
    let pack: Vec<u8> = band_payloads(&events, Band::Pack).concat();
    assert_eq!(pack, b"PACKDATA");
    let progress = band_payloads(&events, Band::Progress);
    assert!(progress
        .iter()
        .any(|line| line.starts_with(b"proxy: h.example: ")));
    assert!(progress
        .iter()
        .any(|line| line == b"proxy: Compressing objects\n"));

    // Housekeeping ran: keep markers cleaned, in-progress refs deleted.
    assert_eq!(*toolchain.keep_cleanups.lock(), vec![CONN_ID.to_owned()]);
    assert!(toolchain
        .deleted
        .lock()
        .contains(&format!("refs/in-progress/{CONN_ID}/refs/heads/main")));
}

#[tokio::test]
async fn test_fully_cached_fetch_is_hot_and_skips_upstream() {
    let head = oid('a');
    let (upstream, log) = scripted_upstream(
        vec![(head.clone(), String::from("refs/heads/main"))],
        false,
    );
    let toolchain = Arc::new(ScriptedToolchain {
        present: HashSet::from([head.clone()]),
        ..ScriptedToolchain::default()
    });
    let (mut client, engine_side) = client_pair();
    let engine = engine_with(Arc::clone(&toolchain), ScriptedDial::with(upstream));
    let run = tokio::spawn(engine.run(engine_side));

    client
        .send(b"git-upload-pack /r.git\0host=h.example\0")
        .await;
    client.send(format!("want {head}\n").as_bytes()).await;
    client.send_flush().await;
    let events = collect_until_closed(&mut client).await;
    client.close().await;

    let state = run.await.unwrap().unwrap();
    assert_eq!(state, CacheState::Hot);
    // Nothing was forwarded upstream.
    assert!(log.wants.lock().is_empty());
    // The pack still reached the client, from the mirror.
    let pack: Vec<u8> = band_payloads(&events, Band::Pack).concat();
    assert_eq!(pack, b"PACKDATA");
    assert_eq!(
        *toolchain.replayed_wants.lock(),
        vec![format!("want {head}")]
    );
}

#[tokio::test]
async fn test_want_dedup_forwards_only_missing_ids() {
    let (a, b, c) = (oid('a'), oid('b'), oid('c'));
    let (upstream, log) = scripted_upstream(
        vec![
            (a.clone(), String::from("refs/heads/one")),
            (b.clone(), String::from("refs/heads/two")),
            (c.clone(), String::from("refs/heads/three")),
        ],
        false,
    );
    let toolchain = Arc::new(ScriptedToolchain {
        present: HashSet::from([b.clone()]),
        ..ScriptedToolchain::default()
    });
    let (mut client, engine_side) = client_pair();
    let engine = engine_with(Arc::clone(&toolchain), ScriptedDial::with(upstream));
    let run = tokio::spawn(engine.run(engine_side));

    client
        .send(b"git-upload-pack /r.git\0host=h.example\0")
        .await;
    for id in [&a, &b, &c] {
        client.send(format!("want {id}\n").as_bytes()).await;
    }
    // A duplicate is ignored.
    client.send(format!("want {a}\n").as_bytes()).await;
    client.send_flush().await;
    collect_until_closed(&mut client).await;
    client.close().await;

    let state = run.await.unwrap().unwrap();
    // No haves were acknowledged, so the fetch stays cold.
    assert_eq!(state, CacheState::Cold);
    assert_eq!(
        *log.wants.lock(),
        vec![
            format!("want {a} side-band side-band-64k"),
            format!("want {c}"),
        ]
    );
    // Replay to the local transmitter keeps the full original set.
    assert_eq!(
        *toolchain.replayed_wants.lock(),
        vec![
            format!("want {a}"),
            format!("want {b}"),
            format!("want {c}"),
        ]
    );
}

#[tokio::test]
async fn test_empty_want_set_classifies_no_objects() {
    let head = oid('a');
    let (upstream, _log) = scripted_upstream(
        vec![(head.clone(), String::from("refs/heads/main"))],
        false,
    );
    let toolchain = Arc::new(ScriptedToolchain::default());
    let (mut client, engine_side) = client_pair();
    let engine = engine_with(Arc::clone(&toolchain), ScriptedDial::with(upstream));
    let run = tokio::spawn(engine.run(engine_side));

    client
        .send(b"git-upload-pack /r.git\0host=h.example\0")
        .await;
    client.send_flush().await;
    collect_until_closed(&mut client).await;
    client.close().await;

    let state = run.await.unwrap().unwrap();
    assert_eq!(state, CacheState::NoObjects);
    // No pack transmission happened.
    assert_eq!(*toolchain.pack_sessions.lock(), 0);
    assert!(toolchain.updated.lock().is_empty());
}

#[tokio::test]
async fn test_wrong_service_gets_inline_error() {
    let toolchain = Arc::new(ScriptedToolchain::default());
    let dial = Arc::new(ScriptedDial::default());
    let (mut client, engine_side) = client_pair();
    let engine = engine_with(Arc::clone(&toolchain), dial);
    let run = tokio::spawn(engine.run(engine_side));

    client
        .send(b"git-receive-pack /r.git\0host=h.example\0")
        .await;
    let events = collect_until_closed(&mut client).await;
    client.close().await;

    let error = run.await.unwrap().unwrap_err();
    assert!(matches!(error, ProxyError::Protocol(_)));
    let err_frame = events.iter().find_map(|event| match event {
        StreamEvent::Frame(frame) if frame.payload().starts_with(b"ERR ") => {
            Some(String::from_utf8_lossy(frame.payload()).into_owned())
        }
        _ => None,
    });
    assert!(err_frame.unwrap().contains("bad request"));
    // Abort-path housekeeping still ran.
    assert_eq!(*toolchain.keep_cleanups.lock(), vec![CONN_ID.to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_upstream_reports_transport_error() {
    let toolchain = Arc::new(ScriptedToolchain::default());
    let dial = Arc::new(ScriptedDial::default());
    let (mut client, engine_side) = client_pair();
    let mut config = EngineConfig::default();
    config.connect_backoff = Backoff {
        max_total: Duration::from_millis(50),
        initial_interval: Duration::from_millis(10),
    };
    let engine = ConnectionEngine::new(
        CONN_ID.to_owned(),
        Arc::clone(&toolchain) as Arc<dyn Toolchain>,
        dial,
        config,
        Arc::new(Mutex::new(Phase::AwaitingRequestLine)),
    );
    let run = tokio::spawn(engine.run(engine_side));

    client
        .send(b"git-upload-pack /r.git\0host=unreachable.example\0")
        .await;
    let events = collect_until_closed(&mut client).await;

    let error = run.await.unwrap().unwrap_err();
    assert!(matches!(error, ProxyError::Transport(_)));
    assert!(events.iter().any(|event| matches!(
        event,
        StreamEvent::Frame(frame) if frame.payload().starts_with(b"ERR ")
    )));
}
