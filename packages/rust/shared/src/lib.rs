//! Shared types, error model, and configuration for feedingest.
//!
//! This crate is the foundation depended on by all other feedingest crates.
//! It provides:
//! - [`IngestError`] - the unified error type
//! - Domain types ([`Stage`], [`SiteId`], [`RunTimestamp`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, PublishConfig, RunConfig, StorageConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, publish_api_key,
    storage_token,
};
pub use error::{IngestError, Result};
pub use types::{NORMALIZED_SCHEMA_VERSION, RunTimestamp, SiteId, Stage, is_visible};
