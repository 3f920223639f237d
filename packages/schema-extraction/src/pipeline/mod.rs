//! Extraction pipeline - the core of the library.
//!
//! The pipeline orchestrates:
//! - Schema decomposition into object-type levels (hierarchy, fragment)
//! - Planning of identity and remaining-field groups, with coverage checks
//! - Page classification against plan categories, cached per source file
//! - Identity extraction and duplicate resolution per level
//! - Remaining-field extraction in skim or exhaustive mode
//! - Rollup into a nested object graph

pub mod classification;
pub mod field_types;
pub mod fields;
pub mod fingerprint;
pub mod fragment;
pub mod hierarchy;
pub mod identity;
pub mod levels;
pub mod matcher;
pub mod orchestrator;
pub mod planning;
pub mod prompts;
pub mod rollup;

pub use classification::{build_boolean_schema, ClassificationEngine, ClassificationSummary};
pub use field_types::{FieldPredicate, FieldType};
pub use fields::FieldExtractionEngine;
pub use fingerprint::{canonical_json, compute_schema_hash, plan_fingerprint};
pub use fragment::{get_nesting_keys, get_parent_type};
pub use hierarchy::extract_hierarchy;
pub use identity::IdentityResolutionEngine;
pub use levels::LevelOrchestrator;
pub use matcher::{DuplicateMatcher, MatchScope};
pub use orchestrator::{Orchestrator, StepOutcome};
pub use planning::{PlanningEngine, MAX_COVERAGE_ATTEMPTS};
pub use rollup::{build_rollup, RollupEngine};
