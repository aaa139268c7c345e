/**
 * channel.rs
 * Correlated request/response channel over a worker's stdin/stdout.
 *
 * The channel owns a background reader task. Inbound lines that do not
 * parse as JSON objects carrying the "jsonrpc" marker are diagnostic
 * noise and are discarded at debug level; a noise line never fails a
 * call. Ids increase monotonically per channel and every response is
 * matched to its pending call by id, so a late response to an abandoned
 * call is discarded instead of being delivered to the wrong caller.
 *
 * One request is in flight at a time; `call` serializes internally.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::{BridgeError, Result};
use crate::rpc::envelope::{RpcRequest, RpcResponse};

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

pub struct RpcChannel {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingMap,
    next_id: AtomicU64,
    suspect: AtomicBool,
    open: Arc<AtomicBool>,
    call_gate: Mutex<()>,
    reader_task: JoinHandle<()>,
    label: String,
}

impl RpcChannel {
    /// Build a channel over any stream pair. Production wires the
    /// worker's stdin/stdout; tests wire an in-memory duplex.
    pub fn new<R, W>(reader: R, writer: W, label: &str) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&open),
            label.to_string(),
        ));

        RpcChannel {
            writer: Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(1),
            suspect: AtomicBool::new(false),
            open,
            call_gate: Mutex::new(()),
            reader_task,
            label: label.to_string(),
        }
    }

    /// Issue one call and wait for its correlated response.
    ///
    /// Timeout marks the channel suspect and returns `WorkerTimeout`;
    /// a closed stream returns `Protocol`. An engine-side `error`
    /// member surfaces verbatim as `Engine`.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        // One outstanding request per channel
        let _gate = self.call_gate.lock().await;

        if !self.open.load(Ordering::SeqCst) {
            self.suspect.store(true, Ordering::SeqCst);
            return Err(BridgeError::Protocol(format!(
                "channel to worker '{}' is closed",
                self.label
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock_pending(&self.pending);
            pending.insert(id, tx);
        }

        let request = RpcRequest::new(id, method, params);
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                lock_pending(&self.pending).remove(&id);
                self.suspect.store(true, Ordering::SeqCst);
                return Err(BridgeError::Protocol(format!(
                    "failed to write to worker '{}': {}",
                    self.label, e
                )));
            }
            if let Err(e) = writer.flush().await {
                lock_pending(&self.pending).remove(&id);
                self.suspect.store(true, Ordering::SeqCst);
                return Err(BridgeError::Protocol(format!(
                    "failed to flush to worker '{}': {}",
                    self.label, e
                )));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                // Late responses to this id will be unmatched and discarded
                lock_pending(&self.pending).remove(&id);
                self.suspect.store(true, Ordering::SeqCst);
                Err(BridgeError::WorkerTimeout(format!(
                    "worker '{}' did not answer '{}' within {:?}",
                    self.label, method, timeout
                )))
            }
            Ok(Err(_)) => {
                self.suspect.store(true, Ordering::SeqCst);
                Err(BridgeError::Protocol(format!(
                    "worker '{}' closed the stream during '{}'",
                    self.label, method
                )))
            }
            Ok(Ok(response)) => {
                if let Some(err) = response.error {
                    return Err(BridgeError::Engine {
                        code: err.code,
                        message: err.message,
                    });
                }
                Ok(response.result.unwrap_or(Value::Null))
            }
        }
    }

    /// Marked on timeout or framing failure. A suspect channel is never
    /// reused; the pool replaces the whole worker.
    pub fn is_suspect(&self) -> bool {
        self.suspect.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Stop the reader task and fail any in-flight call.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.reader_task.abort();
        lock_pending(&self.pending).clear();
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<RpcResponse>>> {
    // Sender map holds no state that can be poisoned into inconsistency
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn read_loop<R>(reader: R, pending: PendingMap, open: Arc<AtomicBool>, label: String)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                // Frames are JSON objects carrying the jsonrpc marker;
                // everything else is engine chatter.
                let value: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(_) => {
                        debug!(worker = %label, "discarding non-JSON output line");
                        continue;
                    }
                };
                if value.get("jsonrpc").is_none() {
                    debug!(worker = %label, "discarding JSON line without jsonrpc marker");
                    continue;
                }

                let response: RpcResponse = match serde_json::from_value(value) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(worker = %label, error = %e, "malformed response frame discarded");
                        continue;
                    }
                };

                let Some(id) = response.call_id() else {
                    debug!(worker = %label, "discarding frame without integer id");
                    continue;
                };

                let sender = lock_pending(&pending).remove(&id);
                match sender {
                    // Receiver may be gone if the caller timed out or was cancelled
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        debug!(worker = %label, id, "discarding response with no pending call");
                    }
                }
            }
            Ok(None) => {
                debug!(worker = %label, "worker stdout reached EOF");
                break;
            }
            Err(e) => {
                warn!(worker = %label, error = %e, "error reading worker stdout");
                break;
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    // Dropping the senders fails any caller still waiting
    lock_pending(&pending).clear();
}
