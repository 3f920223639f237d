//! Candidate search and duplicate decisions for extracted instances.
//!
//! Search queries arrive loosest first. The matcher walks them in order and
//! settles on the first result set small enough to reason about (1-5
//! objects), falling back to the most specific non-empty result.

use serde_json::{Map, Value};
use std::ops::RangeInclusive;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::pipeline::field_types::{FieldPredicate, FieldType};
use crate::pipeline::prompts::format_resolve_duplicate_prompt;
use crate::traits::inference::{response_schema, submit_bounded, InferenceRequest, InferenceService};
use crate::traits::store::{ObjectQuery, Store};
use crate::types::{
    config::RunnerConfig,
    object::{is_blank, value_to_text, CandidateSet, ResolutionResult, ResolvedObject},
    process::Operation,
};

/// Raw matches fetched per query.
pub const MAX_RAW_MATCHES: usize = 50;

/// Candidates kept per query after trimming.
pub const MAX_CANDIDATES: usize = 20;

/// Result sizes considered specific enough to stop searching.
pub const OPTIMAL_BAND: RangeInclusive<usize> = 1..=5;

/// Where candidates may come from.
#[derive(Debug, Clone)]
pub struct MatchScope {
    pub team_id: Uuid,
    pub object_type: String,
    pub root_object_id: Option<Uuid>,
    pub schema_definition_id: Option<Uuid>,
}

/// Multi-strategy candidate search plus LLM tie-breaking.
pub struct DuplicateMatcher<'a, S: ?Sized, I: ?Sized> {
    store: &'a S,
    inference: &'a I,
    config: &'a RunnerConfig,

    /// Task schema, used to type each searched field
    schema: &'a Value,
}

impl<'a, S, I> DuplicateMatcher<'a, S, I>
where
    S: Store + ?Sized,
    I: InferenceService + ?Sized,
{
    pub fn new(store: &'a S, inference: &'a I, config: &'a RunnerConfig, schema: &'a Value) -> Self {
        Self {
            store,
            inference,
            config,
            schema,
        }
    }

    /// Typed predicates for one search query; skipped criteria are left out.
    pub fn build_predicates(&self, query: &Value) -> Vec<FieldPredicate> {
        let Some(criteria) = query.as_object() else {
            return Vec::new();
        };
        criteria
            .iter()
            .filter_map(|(field, criterion)| {
                let field_type = FieldType::resolve(self.schema, field);
                FieldPredicate::new(field.clone(), field_type, criterion)
            })
            .collect()
    }

    /// Find existing objects the extracted instance may duplicate.
    #[instrument(skip(self, search_queries, extracted, identity_fields), fields(object_type = %scope.object_type))]
    pub async fn find_candidates(
        &self,
        scope: &MatchScope,
        search_queries: &[Value],
        extracted: Option<&Map<String, Value>>,
        identity_fields: &[String],
    ) -> Result<CandidateSet> {
        if let Some(name) = extracted
            .and_then(|data| data.get("name"))
            .filter(|v| !is_blank(Some(v)))
        {
            let name = value_to_text(name);
            if let Some(existing) = self
                .store
                .find_by_name(
                    scope.team_id,
                    &scope.object_type,
                    scope.root_object_id,
                    scope.schema_definition_id,
                    name.trim(),
                )
                .await?
            {
                debug!(object_id = %existing.id, "Exact name match");
                return Ok(CandidateSet {
                    exact_match_id: Some(existing.id),
                    candidates: vec![existing],
                });
            }
        }

        let mut selected: Vec<ResolvedObject> = Vec::new();

        for (index, query) in search_queries.iter().enumerate() {
            let predicates = self.build_predicates(query);
            if predicates.is_empty() {
                debug!(query_index = index, "Search query has no usable criteria");
                continue;
            }

            let mut results = self
                .store
                .search_objects(&ObjectQuery {
                    team_id: scope.team_id,
                    object_type: scope.object_type.clone(),
                    root_object_id: scope.root_object_id,
                    schema_definition_id: scope.schema_definition_id,
                    predicates,
                    limit: MAX_RAW_MATCHES,
                })
                .await?;
            results.truncate(MAX_CANDIDATES);
            debug!(query_index = index, count = results.len(), "Search query evaluated");

            // A query that finds nothing keeps the previous result.
            if results.is_empty() {
                continue;
            }

            selected = results;
            if OPTIMAL_BAND.contains(&selected.len()) {
                break;
            }
        }

        let exact_match_id = match extracted {
            Some(data) if !identity_fields.is_empty() => {
                let equal: Vec<&ResolvedObject> = selected
                    .iter()
                    .filter(|candidate| self.identity_equal(candidate, data, identity_fields))
                    .collect();
                match equal.as_slice() {
                    [only] => Some(only.id),
                    _ => None,
                }
            }
            _ => None,
        };

        Ok(CandidateSet {
            candidates: selected,
            exact_match_id,
        })
    }

    fn identity_equal(&self, candidate: &ResolvedObject, data: &Map<String, Value>, identity_fields: &[String]) -> bool {
        identity_fields.iter().all(|field| {
            let field_type = FieldType::resolve(self.schema, field);
            field_type.values_equal(candidate.field(field).as_ref(), data.get(field))
        })
    }

    /// Ask the model whether the extracted data duplicates one candidate.
    ///
    /// `None` on a soft inference failure. A verdict naming an object
    /// outside `candidates` is downgraded to "not a duplicate".
    pub async fn resolve_duplicate(
        &self,
        object_type: &str,
        candidates: &[ResolvedObject],
        extracted: &Map<String, Value>,
    ) -> Result<Option<ResolutionResult>> {
        let snapshots: Vec<Value> = candidates
            .iter()
            .map(|c| Value::Object(c.snapshot()))
            .collect();

        let request = InferenceRequest::new(
            Operation::ExtractIdentity,
            format_resolve_duplicate_prompt(object_type, &Value::Object(extracted.clone()), &snapshots),
            response_schema::<ResolutionResult>(),
            self.config.timeout(),
        );
        let Some(json) = submit_bounded(self.inference, request).await.into_json() else {
            return Ok(None);
        };

        let mut result: ResolutionResult = match serde_json::from_value(json) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Unparseable duplicate resolution");
                return Ok(None);
            }
        };

        if result.is_duplicate {
            let known = result
                .existing_object_id
                .is_some_and(|id| candidates.iter().any(|c| c.id == id));
            if !known {
                warn!(
                    existing_object_id = ?result.existing_object_id,
                    "Duplicate verdict names an object outside the candidates"
                );
                result.is_duplicate = false;
                result.existing_object_id = None;
            }
        } else {
            result.existing_object_id = None;
        }

        Ok(Some(result))
    }
}
