/**
 * worker.rs
 * Spawning and watching one Calibre worker process.
 *
 * The engine only runs inside `calibre-debug`, so each library gets a
 * long-lived `calibre-debug -e <script> -- <library_path>` child with
 * piped stdio. Stdout carries protocol frames, stderr carries the
 * startup handshake and engine diagnostics. A worker announces
 * readiness by printing a JSON line with `"status": "ready"` on
 * stderr; anything it prints before that is banner noise.
 *
 * The spawner and process are traits so the pool and its tests can run
 * against in-memory workers over duplex streams.
 */

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::model::{GlobalSettings, LibraryConfig};
use crate::errors::{BridgeError, Result};
use crate::rpc::RpcChannel;

/// How long a fresh worker gets to print its ready line.
pub const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Stderr lines kept for crash diagnostics.
const STDERR_RING_CAPACITY: usize = 50;

/// A live worker's OS-process side. The pool owns exactly one per
/// library and drives its shutdown.
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;
    /// Non-blocking liveness probe.
    fn is_alive(&mut self) -> bool;
    /// Ask the process to exit. Returns false when the request could
    /// not be delivered.
    fn terminate(&mut self) -> bool;
    /// Force the process down.
    fn kill(&mut self);
    /// Most relevant recent stderr line, for attaching to errors.
    fn crash_diagnostic(&self) -> Option<String>;
}

pub struct SpawnedWorker {
    pub process: Box<dyn WorkerProcess>,
    pub channel: RpcChannel,
}

pub type SpawnFuture = Pin<Box<dyn Future<Output = Result<SpawnedWorker>> + Send>>;

pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, library: Arc<LibraryConfig>, globals: Arc<GlobalSettings>) -> SpawnFuture;
}

/// Bounded ring of recent stderr lines.
#[derive(Default)]
pub struct StderrLog {
    lines: StdMutex<VecDeque<String>>,
}

impl StderrLog {
    pub fn push(&self, line: String) {
        let mut lines = match self.lines.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if lines.len() == STDERR_RING_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Pick the line most likely to explain a failure: the newest line
    /// shaped like `{"error": ...}` wins, otherwise the newest line
    /// that is not a warning or blank.
    pub fn most_relevant(&self) -> Option<String> {
        let lines = match self.lines.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };

        let mut fallback = None;
        for line in lines.iter().rev() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("Warning") {
                continue;
            }
            if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(trimmed) {
                if let Some(err) = obj.get("error") {
                    let msg = err
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| err.to_string());
                    return Some(msg);
                }
            }
            if fallback.is_none() {
                fallback = Some(trimmed.to_string());
            }
        }
        fallback
    }
}

/// Spawns real `calibre-debug` workers.
pub struct CalibreWorkerSpawner {
    calibre_debug: PathBuf,
    log_dir: PathBuf,
}

impl CalibreWorkerSpawner {
    pub fn new(log_dir: PathBuf) -> Self {
        CalibreWorkerSpawner {
            calibre_debug: PathBuf::from("calibre-debug"),
            log_dir,
        }
    }

    pub fn with_binary(mut self, path: PathBuf) -> Self {
        self.calibre_debug = path;
        self
    }
}

impl WorkerSpawner for CalibreWorkerSpawner {
    fn spawn(&self, library: Arc<LibraryConfig>, globals: Arc<GlobalSettings>) -> SpawnFuture {
        let calibre_debug = self.calibre_debug.clone();
        let log_dir = self.log_dir.clone();

        Box::pin(async move {
            let script = globals.worker_script.clone().ok_or_else(|| {
                BridgeError::Config("worker_script is not configured".to_string())
            })?;

            let mut child = tokio::process::Command::new(&calibre_debug)
                .arg("-e")
                .arg(&script)
                .arg("--")
                .arg(&library.path)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    BridgeError::WorkerSpawn(format!(
                        "failed to start {} for library '{}': {}",
                        calibre_debug.display(),
                        library.name,
                        e
                    ))
                })?;

            let stdin = child.stdin.take().ok_or_else(|| {
                BridgeError::WorkerSpawn("worker stdin was not piped".to_string())
            })?;
            let stdout = child.stdout.take().ok_or_else(|| {
                BridgeError::WorkerSpawn("worker stdout was not piped".to_string())
            })?;
            let stderr = child.stderr.take().ok_or_else(|| {
                BridgeError::WorkerSpawn("worker stderr was not piped".to_string())
            })?;

            let log = Arc::new(StderrLog::default());
            let log_file = if globals.enable_worker_logging {
                Some(log_dir.join(format!("worker_{}_stderr.log", library.name)))
            } else {
                None
            };

            let (ready_tx, ready_rx) = oneshot::channel();
            tokio::spawn(watch_stderr(
                stderr,
                Arc::clone(&log),
                log_file,
                ready_tx,
                library.name.clone(),
            ));

            match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => {
                    // Stderr closed without a ready line, or the
                    // deadline passed. Either way the worker is unusable.
                    let _ = child.start_kill();
                    let detail = log
                        .most_relevant()
                        .unwrap_or_else(|| "no ready signal from worker".to_string());
                    return Err(BridgeError::WorkerSpawn(format!(
                        "worker for library '{}' failed to start: {}",
                        library.name, detail
                    )));
                }
            }

            let pid = child.id();
            info!(library = %library.name, pid, "worker ready");

            let channel = RpcChannel::new(stdout, stdin, &library.name);
            Ok(SpawnedWorker {
                process: Box::new(CalibreWorkerProcess {
                    child,
                    pid,
                    log,
                    library: library.name.clone(),
                }),
                channel,
            })
        })
    }
}

async fn watch_stderr(
    stderr: tokio::process::ChildStderr,
    log: Arc<StderrLog>,
    log_file: Option<PathBuf>,
    ready_tx: oneshot::Sender<()>,
    library: String,
) {
    let mut sink = match &log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
            {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(library = %library, error = %e, "cannot open worker stderr log");
                    None
                }
            }
        }
        None => None,
    };

    let mut ready_tx = Some(ready_tx);
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(file) = sink.as_mut() {
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
        }

        if ready_tx.is_some() {
            if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line.trim()) {
                if obj.get("status").and_then(Value::as_str) == Some("ready") {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                    continue;
                }
            }
        }

        log.push(line);
    }

    debug!(library = %library, "worker stderr closed");
}

struct CalibreWorkerProcess {
    child: tokio::process::Child,
    pid: Option<u32>,
    log: Arc<StderrLog>,
    library: String,
}

impl WorkerProcess for CalibreWorkerProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match self.pid {
            Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok(),
            None => false,
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> bool {
        // No graceful signal on this platform; fall through to kill
        false
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(library = %self.library, error = %e, "kill failed (already dead?)");
        }
    }

    fn crash_diagnostic(&self) -> Option<String> {
        self.log.most_relevant()
    }
}
