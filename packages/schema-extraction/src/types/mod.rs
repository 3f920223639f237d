//! Data types for the extraction orchestrator.

pub mod artifact;
pub mod config;
pub mod object;
pub mod plan;
pub mod process;
pub mod rollup;
pub mod run;
pub mod schema;
