//! Configuration loading and library resolution

pub mod model;
pub mod store;

pub use model::{
    ExportConfig, FieldRule, GlobalSettings, ImportConfig, LibraryConfig, Permissions,
};
pub use store::{ConfigStore, LibrarySummary};
