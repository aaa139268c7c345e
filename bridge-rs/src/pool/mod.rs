//! Per-library worker processes and their lifecycle

pub mod manager;
pub mod worker;

pub use manager::{LeasedWorker, WorkerPoolManager, WorkerState};
pub use worker::{
    CalibreWorkerSpawner, SpawnFuture, SpawnedWorker, StderrLog, WorkerProcess, WorkerSpawner,
};
