//! strata-lib: the build orchestration engine behind `strata`.
//!
//! This crate provides:
//! - `ArtifactCoordinate` resolution with local project substitution
//! - a `TaskGraph` whose edges are declared or inferred from task paths
//! - an `IncrementalCache` of task fingerprints
//! - a bounded async executor producing a `RunReport`
//! - distribution archives and a resumable release pipeline

pub mod cache;
pub mod config;
pub mod consts;
pub mod distribution;
pub mod execute;
pub mod graph;
pub mod load;
pub mod project;
pub mod release;
pub mod repository;
pub mod resolve;
pub mod util;
