//! Shared types, error model, and configuration for recordfill.
//!
//! This crate is the foundation depended on by all other recordfill crates.
//! It provides:
//! - [`RecordfillError`]: the unified error type
//! - Domain types ([`PartialRecord`], [`ResolvedRecord`], [`Candidate`], [`CacheKey`], ...)
//! - Configuration ([`AppConfig`], [`ResolverConfig`], config loading)
//! - Text normalisation used for keys and comparisons ([`text`])

pub mod config;
pub mod error;
pub mod text;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BatchConfig, CacheConfig, CascadeConfig, CascadeStage, ColumnsConfig,
    EndpointsConfig, FiltersConfig, LlmConfig, ResolverConfig, SourcesConfig, TimeoutsConfig,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
    validate_config,
};
pub use error::{RecordfillError, Result};
pub use types::{
    CacheEntry, CacheKey, Candidate, FieldKind, LookupStatus, PartialRecord, PostalPayload,
    Provenance, RecordStatus, Resolved, ResolvedRecord, record_hash,
};
