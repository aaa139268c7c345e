//! # Calibre Bridge
//!
//! Bridging layer that exposes operations on a set of independently
//! managed Calibre libraries to a calling agent. The Calibre engine
//! only runs inside `calibre-debug`, so every library is served by a
//! dedicated worker process speaking line-framed JSON-RPC 2.0 over its
//! stdin/stdout.
//!
//! ## Architecture
//!
//! ```text
//! caller ──> Router ──> PermissionEnforcer (may short-circuit)
//!                │
//!                └──> WorkerPoolManager ──> RpcChannel ──> worker
//!                         (one worker per library, reused)
//! ```
//!
//! Permission denials are decided from configuration alone and never
//! touch a process. Same-library requests are strictly serialized;
//! different libraries run in parallel.

pub mod config;
pub mod errors;
pub mod permissions;
pub mod pool;
pub mod router;
pub mod rpc;

pub use config::{
    ConfigStore, ExportConfig, FieldRule, GlobalSettings, ImportConfig, LibraryConfig, Permissions,
};
pub use errors::{BridgeError, Result};
pub use permissions::{Action, Denial};
pub use pool::{CalibreWorkerSpawner, WorkerPoolManager, WorkerProcess, WorkerSpawner};
pub use router::Router;
pub use rpc::{RpcChannel, RpcRequest, RpcResponse};

pub const VERSION: &str = "0.3.0";

/// Environment variable naming the config file, checked when no
/// `--config` flag is given.
pub const CONFIG_PATH_ENV: &str = "CALIBREMCP_CONFIGPATH";
