//! Resolution pipeline for recordfill.
//!
//! This crate ties the source clients, extractor, and postal cache together:
//! query construction, per-record resolution, the postal-code cascade, table
//! I/O, and the batch runner.

pub mod batch;
pub mod cascade;
pub mod disambiguate;
pub mod query;
pub mod resolver;
pub mod table;

#[cfg(test)]
mod mocks;

pub use batch::{BatchProgress, RunSummary, SilentProgress, SourceFactory, run_batch};
pub use cascade::{CascadeSources, PostalCascade, PostalOutcome, PostalRequest};
pub use disambiguate::Disambiguator;
pub use query::build_queries;
pub use resolver::{Resolver, Sources};
