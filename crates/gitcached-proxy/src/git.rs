//! The seam between the proxy and the external `git` toolchain.
//!
//! Everything object-, pack- and ref-shaped is delegated to the `git`
//! binary working on the local mirror repository. [`Toolchain`] is the
//! trait the connection engine talks to; [`GitToolchain`] is the
//! subprocess-backed implementation. Tests swap in a scripted
//! implementation so no git binary or network is needed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use gitcached_proc::ProcessQueue;
use gitcached_wire::{DynPktStream, DynWriter, PktStream};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ProxyError, Result};
use crate::lines::LineSplitter;
use crate::types::ObjectId;

/// A running pack-indexing subprocess.
///
/// Channel-1 bytes go into `input`; shutting `input` down tells the
/// indexer the pack is complete. `progress` carries the indexer's own
/// diagnostic lines; `done` resolves with its exit status.
pub struct PackIngest {
    pub input: DynWriter,
    pub progress: mpsc::UnboundedReceiver<String>,
    pub done: oneshot::Receiver<bool>,
}

/// A running pack-transmission subprocess, speaking pkt-line on
/// `stream` exactly like an upstream server would.
pub struct PackSession {
    pub stream: DynPktStream,
    pub done: oneshot::Receiver<bool>,
}

/// Operations the engine needs from the revision-control toolchain.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Whether the object is already present in the mirror. The check
    /// runs through the shared process queue; the receiver resolves
    /// when its turn has come and gone.
    fn lookup_object(&self, id: &ObjectId) -> oneshot::Receiver<bool>;

    /// Most recent commits reachable from the persistent namespace,
    /// newest first, at most `limit`.
    async fn recent_persistent_commits(&self, limit: usize) -> Result<Vec<ObjectId>>;

    /// Starts ingesting one pack into the mirror, tagging the pack's
    /// keep marker with `keep_tag`.
    async fn start_pack_ingest(&self, keep_tag: &str) -> Result<PackIngest>;

    /// Starts a pack transmitter serving from the mirror.
    async fn start_pack_send(&self) -> Result<PackSession>;

    /// Points `name` at `id`, without dereferencing. Resolves true on
    /// success. Queued like lookups.
    fn update_ref(&self, name: &str, id: &ObjectId) -> oneshot::Receiver<bool>;

    /// Full names of refs under `prefix`.
    async fn list_refs(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete_ref(&self, name: &str) -> Result<()>;

    /// Deletes keep markers tagged with `keep_tag` from the mirror's
    /// pack directory. Returns how many were removed.
    async fn cleanup_keep_files(&self, keep_tag: &str) -> Result<usize>;

    /// Best-effort removal of a connection's emptied in-progress ref
    /// directories. Failure is expected while siblings remain.
    async fn prune_ref_dirs(&self, connection_id: &str);
}

/// [`Toolchain`] backed by the `git` binary and a mirror directory.
#[derive(Clone)]
pub struct GitToolchain {
    mirror: PathBuf,
    queue: ProcessQueue,
}

impl GitToolchain {
    pub fn new(mirror: impl Into<PathBuf>, queue: ProcessQueue) -> Self {
        Self {
            mirror: mirror.into(),
            queue,
        }
    }

    pub fn into_shared(self) -> Arc<dyn Toolchain> {
        Arc::new(self)
    }

    /// Initialises the mirror as a bare repository if it is not one
    /// yet. Called once at daemon startup.
    pub async fn ensure_mirror(&self) -> Result<()> {
        if tokio::fs::try_exists(self.mirror.join("objects")).await? {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.mirror).await?;
        let output = Command::new("git")
            .arg("init")
            .arg("--bare")
            .arg(&self.mirror)
            .output()
            .await?;
        if !output.status.success() {
            return Err(ProxyError::Subprocess(format!(
                "git init --bare failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::info!(mirror = %self.mirror.display(), "initialised mirror repository");
        Ok(())
    }

    fn git(&self) -> Command {
        let mut command = Command::new("git");
        command.arg("-C").arg(&self.mirror);
        command
    }
}

#[async_trait]
impl Toolchain for GitToolchain {
    fn lookup_object(&self, id: &ObjectId) -> oneshot::Receiver<bool> {
        let mut command = self.git();
        command.args(["rev-list", "--no-walk", id.as_str()]);
        let queued = self.queue.exec(format!("lookup {id}"), command);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let present = matches!(queued.await, Ok(Ok(output)) if output.status.success());
            let _ = tx.send(present);
        });
        rx
    }

    async fn recent_persistent_commits(&self, limit: usize) -> Result<Vec<ObjectId>> {
        let mut command = self.git();
        command.args([
            "rev-list",
            "--glob=refs/persistent/",
            "--date-order",
            &format!("--max-count={limit}"),
        ]);
        let output = self
            .queue
            .exec("rev-list persistent", command)
            .await
            .map_err(|_| ProxyError::Subprocess(String::from("rev-list task dropped")))?
            .map_err(|error| ProxyError::Subprocess(format!("rev-list: {error}")))?;
        if !output.status.success() {
            // An empty persistent namespace makes rev-list complain;
            // that is the cold-cache case, not a failure.
            tracing::debug!(
                status = %output.status,
                "rev-list over persistent refs found nothing"
            );
            return Ok(Vec::new());
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text
            .lines()
            .filter_map(|line| ObjectId::parse(line.trim()).ok())
            .collect())
    }

    async fn start_pack_ingest(&self, keep_tag: &str) -> Result<PackIngest> {
        let mut child = self
            .git()
            .args(["index-pack", "-v", "--stdin", &format!("--keep={keep_tag}")])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| ProxyError::Subprocess(format!("spawn index-pack: {error}")))?;

        let input: DynWriter = Box::new(
            child
                .stdin
                .take()
                .ok_or_else(|| ProxyError::Subprocess(String::from("index-pack has no stdin")))?,
        );
        let (line_tx, progress) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_pump(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_pump(stderr, line_tx);
        }
        let (done_tx, done) = oneshot::channel();
        tokio::spawn(async move {
            let success = matches!(child.wait().await, Ok(status) if status.success());
            let _ = done_tx.send(success);
        });
        Ok(PackIngest {
            input,
            progress,
            done,
        })
    }

    async fn start_pack_send(&self) -> Result<PackSession> {
        let mut child = Command::new("git")
            .arg("upload-pack")
            .arg(&self.mirror)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| ProxyError::Subprocess(format!("spawn upload-pack: {error}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::Subprocess(String::from("upload-pack has no stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Subprocess(String::from("upload-pack has no stdout")))?;
        if let Some(stderr) = child.stderr.take() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            spawn_line_pump(stderr, tx);
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    tracing::debug!(line, "upload-pack");
                }
            });
        }
        let (done_tx, done) = oneshot::channel();
        tokio::spawn(async move {
            let success = matches!(child.wait().await, Ok(status) if status.success());
            let _ = done_tx.send(success);
        });
        Ok(PackSession {
            stream: PktStream::boxed(stdout, stdin).with_label("upload-pack"),
            done,
        })
    }

    fn update_ref(&self, name: &str, id: &ObjectId) -> oneshot::Receiver<bool> {
        let mut command = self.git();
        command.args(["update-ref", "--no-deref", name, id.as_str()]);
        let queued = self.queue.exec(format!("update-ref {name}"), command);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let ok = matches!(queued.await, Ok(Ok(output)) if output.status.success());
            let _ = tx.send(ok);
        });
        rx
    }

    async fn list_refs(&self, prefix: &str) -> Result<Vec<String>> {
        let mut command = self.git();
        command.args(["for-each-ref", "--format=%(refname)", prefix]);
        let output = self
            .queue
            .exec(format!("for-each-ref {prefix}"), command)
            .await
            .map_err(|_| ProxyError::Subprocess(String::from("for-each-ref task dropped")))?
            .map_err(|error| ProxyError::Subprocess(format!("for-each-ref: {error}")))?;
        if !output.status.success() {
            return Err(ProxyError::LocalState(format!(
                "for-each-ref {prefix} exited {}",
                output.status
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().map(str::to_owned).collect())
    }

    async fn delete_ref(&self, name: &str) -> Result<()> {
        let mut command = self.git();
        command.args(["update-ref", "--no-deref", "-d", name]);
        let output = self
            .queue
            .exec(format!("delete-ref {name}"), command)
            .await
            .map_err(|_| ProxyError::Subprocess(String::from("update-ref task dropped")))?
            .map_err(|error| ProxyError::Subprocess(format!("update-ref -d: {error}")))?;
        if !output.status.success() {
            return Err(ProxyError::LocalState(format!(
                "could not delete {name}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn cleanup_keep_files(&self, keep_tag: &str) -> Result<usize> {
        let pack_dir = self.mirror.join("objects").join("pack");
        let mut entries = match tokio::fs::read_dir(&pack_dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(error) => {
                return Err(ProxyError::LocalState(format!(
                    "reading {}: {error}",
                    pack_dir.display()
                )))
            }
        };
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| ProxyError::LocalState(error.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("keep") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(content) if content.trim() == keep_tag => {
                    if let Err(error) = tokio::fs::remove_file(&path).await {
                        tracing::warn!(file = %path.display(), %error, "keep marker not removed");
                    } else {
                        removed += 1;
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(file = %path.display(), %error, "keep marker not readable");
                }
            }
        }
        Ok(removed)
    }

    async fn prune_ref_dirs(&self, connection_id: &str) {
        let own = self
            .mirror
            .join(crate::refs::IN_PROGRESS_ROOT)
            .join(connection_id);
        if let Err(error) = tokio::fs::remove_dir_all(&own).await {
            tracing::debug!(dir = %own.display(), %error, "in-progress dir not removed");
        }
        // Only succeeds once the last sibling is gone.
        let parent = self.mirror.join(crate::refs::IN_PROGRESS_ROOT);
        if let Err(error) = tokio::fs::remove_dir(&parent).await {
            tracing::debug!(dir = %parent.display(), %error, "in-progress root kept");
        }
    }
}

fn spawn_line_pump<R>(mut reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncReadExt + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut splitter = LineSplitter::new();
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for line in splitter.push(&chunk[..n]) {
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                }
            }
        }
        if let Some(line) = splitter.finish() {
            let _ = tx.send(line);
        }
    });
}
