//! Core trait abstractions for the orchestrator.
//!
//! These traits define the interfaces that applications implement
//! to provide storage and inference capabilities.

pub mod inference;
pub mod store;
