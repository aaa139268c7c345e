//! Line-framed JSON-RPC 2.0 over a worker's stdio

pub mod channel;
pub mod envelope;

pub use channel::RpcChannel;
pub use envelope::{RpcErrorObject, RpcRequest, RpcResponse, JSONRPC_VERSION};
