//! Hierarchical Schema-Driven Extraction Library
//!
//! Turns a nested JSON-schema-like definition plus a set of page artifacts
//! into a graph of resolved, de-duplicated objects.
//!
//! # Design Philosophy
//!
//! **"Plan once, resolve level by level"**
//!
//! - The schema is decomposed into object types by nesting depth
//! - A model plans identity fields and field groups once per schema, cached
//! - Pages are classified against the plan, cached per source file
//! - Each level resolves identities before filling remaining fields
//! - Every step is re-entrant; soft inference failures never corrupt state
//!
//! # Usage
//!
//! ```rust,ignore
//! use schema_extraction::{MemoryStore, Orchestrator, TaskDefinition};
//! use schema_extraction::testing::MockInference;
//!
//! let orchestrator = Orchestrator::new(MemoryStore::new(), MockInference::new());
//!
//! // Save a task and the page artifacts, then:
//! let run = orchestrator.start_run(task.id, pages.id).await?;
//! let outcome = orchestrator.run_until_idle(run.id, 500).await?;
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Core trait abstractions (InferenceService, Store)
//! - [`types`] - Tasks, runs, processes, artifacts, plans and objects
//! - [`pipeline`] - Planning, classification, identity, fields and rollup
//! - [`stores`] - Storage implementations (MemoryStore)
//! - [`testing`] - Mock implementations and fixtures for testing

pub mod error;
pub mod naming;
pub mod pipeline;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

#[cfg(feature = "openai")]
pub mod ai;

// Re-export core types at crate root
pub use error::{ExtractionError, ValidationError};
pub use traits::{
    inference::{submit_bounded, InferenceRequest, InferenceResponse, InferenceService},
    store::{
        ArtifactStore, ClassificationCache, ObjectQuery, ObjectStore, ProcessStore, RunStore,
        Store, TaskStore,
    },
};
pub use types::{
    artifact::{Artifact, ArtifactMeta, ClassificationCacheEntry, Provenance, SourceFile},
    config::{GlobalSearchMode, RunnerConfig, SearchMode},
    object::{CandidateSet, ResolutionResult, ResolvedObject},
    plan::{ExtractionPlan, IdentityGroup, LevelPlan, PlanCacheEntry, RemainingGroup},
    process::{Operation, Process, ProcessMeta},
    rollup::{RollupOutput, RollupSummary},
    run::{LevelProgress, Run, TaskDefinition},
    schema::{FragmentSelector, ObjectTypeNode, SelectorType, SimpleField},
};

// Re-export the orchestrator
pub use pipeline::{Orchestrator, StepOutcome};

// Re-export pipeline components
pub use pipeline::{
    // Schema decomposition
    extract_hierarchy, get_nesting_keys, get_parent_type,
    // Fingerprints
    canonical_json, compute_schema_hash, plan_fingerprint,
    // Engines
    ClassificationEngine, ClassificationSummary, DuplicateMatcher, FieldExtractionEngine,
    IdentityResolutionEngine, LevelOrchestrator, MatchScope, PlanningEngine, RollupEngine,
    // Field strategies
    FieldPredicate, FieldType,
    // Helpers
    build_boolean_schema, build_rollup, MAX_COVERAGE_ATTEMPTS,
};

// Re-export stores
pub use stores::MemoryStore;

// Re-export testing utilities
pub use testing::{MockInference, MockInferenceCall};
