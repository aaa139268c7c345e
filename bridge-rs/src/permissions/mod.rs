//! Permission gate evaluated before any worker process is contacted

pub mod enforcer;

pub use enforcer::{check, Action, Denial};
