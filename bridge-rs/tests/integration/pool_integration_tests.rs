// Worker pool integration tests
//
// Drive the pool against scripted in-memory workers: spawn, reuse,
// idle reclaim, crash recovery and shutdown, without a real
// calibre-debug on the machine.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use calibre_bridge::pool::{SpawnFuture, SpawnedWorker, WorkerPoolManager, WorkerProcess, WorkerSpawner};
use calibre_bridge::rpc::{RpcChannel, RpcRequest};
use calibre_bridge::{BridgeError, GlobalSettings, LibraryConfig, Permissions};

/// What a scripted worker does with each request.
#[derive(Clone, Copy)]
enum Script {
    /// Answer every request after the given delay.
    Echo(u64),
    /// Never answer anything.
    Silent,
    /// Close the connection on the first request.
    DieOnRequest,
}

struct MockProcess {
    pid: u32,
    alive: Arc<AtomicBool>,
}

impl WorkerProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
    fn terminate(&mut self) -> bool {
        self.alive.store(false, Ordering::SeqCst);
        true
    }
    fn kill(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
    fn crash_diagnostic(&self) -> Option<String> {
        Some("worker exited unexpectedly".to_string())
    }
}

async fn run_script(stream: tokio::io::DuplexStream, script: Script, alive: Arc<AtomicBool>) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let req: RpcRequest = serde_json::from_str(&line).unwrap();
        match script {
            Script::Echo(delay_ms) => {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                let out = format!(
                    r#"{{"jsonrpc": "2.0", "id": {}, "result": {{"method": "{}"}}}}"#,
                    req.id, req.method
                );
                write_half.write_all(out.as_bytes()).await.unwrap();
                write_half.write_all(b"\n").await.unwrap();
            }
            Script::Silent => {}
            Script::DieOnRequest => {
                alive.store(false, Ordering::SeqCst);
                return;
            }
        }
    }
}

struct ScriptedSpawner {
    scripts: StdMutex<VecDeque<Script>>,
    spawns: AtomicUsize,
}

impl ScriptedSpawner {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(ScriptedSpawner {
            scripts: StdMutex::new(scripts.into()),
            spawns: AtomicUsize::new(0),
        })
    }

    fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl WorkerSpawner for ScriptedSpawner {
    fn spawn(&self, library: Arc<LibraryConfig>, _globals: Arc<GlobalSettings>) -> SpawnFuture {
        let n = self.spawns.fetch_add(1, Ordering::SeqCst) as u32;
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Echo(0));

        Box::pin(async move {
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            let alive = Arc::new(AtomicBool::new(true));
            tokio::spawn(run_script(theirs, script, Arc::clone(&alive)));

            let (read_half, write_half) = tokio::io::split(ours);
            Ok(SpawnedWorker {
                process: Box::new(MockProcess { pid: 5000 + n, alive }),
                channel: RpcChannel::new(read_half, write_half, &library.name),
            })
        })
    }
}

fn library(name: &str, idle_secs: Option<u64>) -> Arc<LibraryConfig> {
    Arc::new(LibraryConfig {
        name: name.to_string(),
        path: PathBuf::from(format!("/data/{}", name)),
        description: None,
        default: false,
        permissions: Permissions::default(),
        import: None,
        export: None,
        worker_timeout: idle_secs,
    })
}

fn globals() -> Arc<GlobalSettings> {
    Arc::new(GlobalSettings {
        call_timeout: 1,
        ..Default::default()
    })
}

#[tokio::test]
async fn crashed_worker_is_replaced_and_next_call_succeeds() {
    let spawner = ScriptedSpawner::new(vec![Script::DieOnRequest, Script::Echo(0)]);
    let pool = WorkerPoolManager::new(spawner.clone(), globals());
    let lib = library("main", None);

    let mut lease = pool.acquire(Arc::clone(&lib)).await.unwrap();
    let err = lease.call("search_books", json!({})).await.unwrap_err();
    match err {
        // Dead process surfaces with its stderr diagnostic attached
        BridgeError::Protocol(msg) => assert!(msg.contains("unexpectedly")),
        other => panic!("expected Protocol error, got {:?}", other),
    }
    drop(lease);

    let mut lease = pool.acquire(lib).await.unwrap();
    let result = lease.call("search_books", json!({})).await.unwrap();
    assert_eq!(result["method"], "search_books");
    assert_eq!(spawner.spawn_count(), 2);
}

#[tokio::test]
async fn timed_out_worker_is_not_reused() {
    let spawner = ScriptedSpawner::new(vec![Script::Silent, Script::Echo(0)]);
    let pool = WorkerPoolManager::new(spawner.clone(), globals());
    let lib = library("main", None);

    let mut lease = pool.acquire(Arc::clone(&lib)).await.unwrap();
    let err = lease.call("fts_search", json!({})).await.unwrap_err();
    assert!(matches!(err, BridgeError::WorkerTimeout(_)));
    drop(lease);

    let mut lease = pool.acquire(lib).await.unwrap();
    let result = lease.call("fts_search", json!({})).await.unwrap();
    assert_eq!(result["method"], "fts_search");
    assert_eq!(spawner.spawn_count(), 2);
}

#[tokio::test]
async fn different_libraries_run_in_parallel() {
    let spawner = ScriptedSpawner::new(vec![Script::Echo(150), Script::Echo(150)]);
    let pool = WorkerPoolManager::new(spawner.clone(), globals());

    let start = Instant::now();
    let a = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let mut lease = pool.acquire(library("a", None)).await.unwrap();
            lease.call("search_books", json!({})).await.unwrap();
        })
    };
    let b = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let mut lease = pool.acquire(library("b", None)).await.unwrap();
            lease.call("search_books", json!({})).await.unwrap();
        })
    };
    a.await.unwrap();
    b.await.unwrap();

    // Serialized execution would need at least 300ms
    assert!(start.elapsed() < Duration::from_millis(290));
    assert_eq!(spawner.spawn_count(), 2);
}

#[tokio::test]
async fn idle_worker_reclaimed_then_respawned() {
    let spawner = ScriptedSpawner::new(vec![]);
    let pool = WorkerPoolManager::new(spawner.clone(), globals());
    let lib = library("main", Some(1));

    let lease = pool.acquire(Arc::clone(&lib)).await.unwrap();
    let first_pid = lease.pid();
    drop(lease);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    pool.sweep_once().await;
    assert!(pool.active_workers().is_empty());

    let lease = pool.acquire(lib).await.unwrap();
    assert_ne!(lease.pid(), first_pid);
    assert_eq!(spawner.spawn_count(), 2);
}

#[tokio::test]
async fn shutdown_stops_workers_and_blocks_acquire() {
    let spawner = ScriptedSpawner::new(vec![]);
    let pool = WorkerPoolManager::new(spawner.clone(), globals());

    let lease_a = pool.acquire(library("a", None)).await.unwrap();
    drop(lease_a);
    let lease_b = pool.acquire(library("b", None)).await.unwrap();
    drop(lease_b);
    assert_eq!(pool.active_workers().len(), 2);

    pool.shutdown().await;
    assert!(pool.active_workers().is_empty());

    let err = pool.acquire(library("a", None)).await.unwrap_err();
    assert!(matches!(err, BridgeError::Protocol(_)));
}

#[tokio::test]
async fn per_library_shutdown_fails_queued_caller_and_allows_respawn() {
    let spawner = ScriptedSpawner::new(vec![]);
    let pool = WorkerPoolManager::new(spawner.clone(), globals());
    let lib = library("main", None);

    let other = pool.acquire(library("other", None)).await.unwrap();
    drop(other);

    let lease = pool.acquire(Arc::clone(&lib)).await.unwrap();

    // The shutdown queues behind the held lease, and a caller queues
    // behind the shutdown
    let stopper = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.shutdown_library("main").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let queued = {
        let pool = Arc::clone(&pool);
        let lib = Arc::clone(&lib);
        tokio::spawn(async move { pool.acquire(lib).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    drop(lease);
    stopper.await.unwrap();
    match queued.await.unwrap() {
        Err(BridgeError::Protocol(msg)) => assert!(msg.contains("shut down")),
        Err(other) => panic!("expected Protocol error, got {:?}", other),
        Ok(_) => panic!("queued caller unexpectedly got a worker"),
    }

    // The other library was untouched, and this one respawns on demand
    let active = pool.active_workers();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].0, "other");

    let mut lease = pool.acquire(lib).await.unwrap();
    let result = lease.call("search_books", json!({})).await.unwrap();
    assert_eq!(result["method"], "search_books");
    assert_eq!(spawner.spawn_count(), 3);
}

#[tokio::test]
async fn spawn_failure_surfaces_and_next_attempt_retries() {
    struct FailingOnce {
        failed: AtomicBool,
        inner: Arc<ScriptedSpawner>,
    }

    impl WorkerSpawner for FailingOnce {
        fn spawn(&self, library: Arc<LibraryConfig>, globals: Arc<GlobalSettings>) -> SpawnFuture {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Box::pin(async {
                    Err(BridgeError::WorkerSpawn(
                        "calibre-debug not found".to_string(),
                    ))
                });
            }
            self.inner.spawn(library, globals)
        }
    }

    let spawner = Arc::new(FailingOnce {
        failed: AtomicBool::new(false),
        inner: ScriptedSpawner::new(vec![]),
    });
    let pool = WorkerPoolManager::new(spawner, globals());
    let lib = library("main", None);

    let err = pool.acquire(Arc::clone(&lib)).await.unwrap_err();
    assert!(matches!(err, BridgeError::WorkerSpawn(_)));

    // The failed spawn left no half-built worker behind
    let mut lease = pool.acquire(lib).await.unwrap();
    let result = lease.call("search_books", json!({})).await.unwrap();
    assert_eq!(result["method"], "search_books");
}
