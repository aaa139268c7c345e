//! Action dispatch: permission gate in front of the worker pool

pub mod dispatch;
pub mod listings;

pub use dispatch::Router;
