//! Storage implementations for the extraction library.
//!
//! Available backends:
//! - `MemoryStore` - In-memory storage (always available)
//!
//! Durable backends implement the traits in [`crate::traits::store`].

pub mod memory;

pub use memory::MemoryStore;
