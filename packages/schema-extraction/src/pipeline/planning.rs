//! Extraction planning: identity and remaining field groups per object type.
//!
//! For every object type in the schema hierarchy the planner asks the model
//! which fields identify an instance (`Plan:Identify`) and how the rest of
//! the fields should be grouped (`Plan:Remaining`). Remaining groups must
//! cover every remaining field exactly once; uncovered fields are re-asked
//! up to [`MAX_COVERAGE_ATTEMPTS`] times before planning fails hard.

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, ValidationError};
use crate::naming::to_snake_case;
use crate::pipeline::fingerprint::plan_fingerprint;
use crate::pipeline::fragment::from_node;
use crate::pipeline::hierarchy::extract_hierarchy;
use crate::pipeline::prompts::{format_plan_identify_prompt, format_plan_remaining_prompt};
use crate::traits::inference::{response_schema, submit_bounded, InferenceRequest, InferenceService};
use crate::traits::store::Store;
use crate::types::{
    config::{RunnerConfig, SearchMode},
    plan::{ExtractionPlan, IdentityGroup, LevelPlan, PlanCacheEntry, RemainingGroup},
    process::{CoverageAttempt, Operation, PlannedGroup, Process, ProcessMeta},
    run::{Run, TaskDefinition},
    schema::ObjectTypeNode,
};

/// Attempts allowed before uncovered fields become a hard error.
pub const MAX_COVERAGE_ATTEMPTS: usize = 3;

/// Model answer for identity planning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IdentityPlanResponse {
    pub identity_fields: Vec<String>,

    #[serde(default)]
    pub skim_fields: Vec<String>,

    /// What pages about this object type look like
    #[serde(default)]
    pub description: Option<String>,
}

/// One group in a remaining-field planning answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlannedGroupResponse {
    pub name: String,
    pub fields: Vec<String>,

    /// "skim" or "exhaustive"
    #[serde(default)]
    pub search_mode: Option<String>,

    #[serde(default)]
    pub description: Option<String>,
}

/// Model answer for remaining-field planning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RemainingPlanResponse {
    pub groups: Vec<PlannedGroupResponse>,
}

/// Result of checking one planning answer against the requested fields.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageCheck {
    /// Groups with unknown and repeated fields removed; empty groups dropped
    pub groups: Vec<PlannedGroupResponse>,
    pub covered: Vec<String>,
    pub missing: Vec<String>,
    pub duplicates: Vec<String>,
}

/// Check an answer's coverage of `requested`.
///
/// Each field is kept in the first group that names it.
pub fn check_coverage(requested: &[String], groups: &[PlannedGroupResponse]) -> CoverageCheck {
    let allowed: HashSet<&str> = requested.iter().map(String::as_str).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut duplicates: Vec<String> = Vec::new();
    let mut kept = Vec::new();

    for group in groups {
        let mut fields = Vec::new();
        for field in &group.fields {
            if !allowed.contains(field.as_str()) {
                continue;
            }
            if seen.insert(field.clone()) {
                fields.push(field.clone());
            } else if !duplicates.contains(field) {
                duplicates.push(field.clone());
            }
        }
        if !fields.is_empty() {
            kept.push(PlannedGroupResponse {
                fields,
                ..group.clone()
            });
        }
    }

    let (covered, missing): (Vec<String>, Vec<String>) =
        requested.iter().cloned().partition(|f| seen.contains(f));

    CoverageCheck {
        groups: kept,
        covered,
        missing,
        duplicates,
    }
}

/// Pick identity and skim fields from an answer.
///
/// Unknown keys are dropped. An empty identity selection falls back to
/// `name`, else the first simple field. The result is capped at
/// `max_fields`.
pub fn select_identity_fields(
    node: &ObjectTypeNode,
    response: &IdentityPlanResponse,
    max_fields: usize,
) -> (Vec<String>, Vec<String>) {
    let known = |keys: &[String]| {
        let mut out: Vec<String> = Vec::new();
        for key in keys {
            if node.field(key).is_some() && !out.contains(key) {
                out.push(key.clone());
            }
        }
        out
    };

    let mut identity = known(&response.identity_fields);
    if identity.is_empty() {
        if node.field("name").is_some() {
            identity.push("name".to_string());
        } else if let Some(first) = node.simple_fields.first() {
            identity.push(first.key.clone());
        }
    }
    identity.truncate(max_fields.max(1));

    (identity, known(&response.skim_fields))
}

/// Split groups larger than `max_fields` into consecutive parts.
pub fn split_oversized(groups: Vec<PlannedGroupResponse>, max_fields: usize) -> Vec<PlannedGroupResponse> {
    let max_fields = max_fields.max(1);
    let mut out = Vec::new();

    for group in groups {
        if group.fields.len() <= max_fields {
            out.push(group);
            continue;
        }
        for (i, chunk) in group.fields.chunks(max_fields).enumerate() {
            out.push(PlannedGroupResponse {
                name: format!("{} Part {}", group.name, i + 1),
                fields: chunk.to_vec(),
                ..group.clone()
            });
        }
    }

    out
}

/// Snake-case a group name, prefixing the object type (then a counter) when
/// the key is already taken.
fn unique_key(name: &str, object_type: &str, used: &mut HashSet<String>) -> String {
    let mut key = to_snake_case(name);
    if used.contains(&key) {
        key = to_snake_case(&format!("{} {}", object_type, name));
    }
    let base = key.clone();
    let mut n = 2;
    while used.contains(&key) {
        key = format!("{}_{}", base, n);
        n += 1;
    }
    used.insert(key.clone());
    key
}

/// Produces and caches extraction plans.
pub struct PlanningEngine<'a, S: ?Sized, I: ?Sized> {
    store: &'a S,
    inference: &'a I,
    config: &'a RunnerConfig,
}

impl<'a, S, I> PlanningEngine<'a, S, I>
where
    S: Store + ?Sized,
    I: InferenceService + ?Sized,
{
    pub fn new(store: &'a S, inference: &'a I, config: &'a RunnerConfig) -> Self {
        Self {
            store,
            inference,
            config,
        }
    }

    /// The task's cached plan if it was built for the current schema and
    /// config.
    pub fn cached_plan(&self, task: &TaskDefinition) -> Option<ExtractionPlan> {
        let entry = task.plan_cache.as_ref()?;
        let key = plan_fingerprint(&task.schema, self.config);
        if entry.cache_key == key {
            Some(entry.plan.clone())
        } else {
            debug!(task_id = %task.id, "Plan cache fingerprint mismatch");
            None
        }
    }

    /// Plan every object type and cache the compiled plan on the task.
    ///
    /// Returns `Ok(None)` on a soft inference failure; completed planning
    /// processes are reused on the next call.
    #[instrument(skip(self, task, run), fields(task_id = %task.id, run_id = %run.id))]
    pub async fn plan(&self, task: &mut TaskDefinition, run: &Run) -> Result<Option<ExtractionPlan>> {
        if let Some(plan) = self.cached_plan(task) {
            debug!("Plan cache hit");
            return Ok(Some(plan));
        }

        let nodes = extract_hierarchy(&task.schema, &task.name);
        if nodes.is_empty() {
            return Err(ValidationError::EmptySchema {
                reason: "root is not an object with properties".to_string(),
            }
            .into());
        }

        let mut levels: BTreeMap<u32, LevelPlan> = BTreeMap::new();
        for node in &nodes {
            levels
                .entry(node.level)
                .or_insert_with(|| LevelPlan::new(node.level));
        }

        let mut ordered: Vec<&ObjectTypeNode> = nodes.iter().collect();
        ordered.sort_by_key(|n| n.level);

        let max_fields = self.config.group_max_points;
        let mut used_keys = HashSet::new();

        for node in ordered {
            if node.simple_fields.is_empty() {
                debug!(object_type = %node.name, "Object type has no simple fields, skipping");
                continue;
            }

            let Some(identity) = self.plan_identity(run, node).await? else {
                return Ok(None);
            };
            let (identity_fields, skim_fields) = select_identity_fields(node, &identity, max_fields);

            let remaining_fields: Vec<String> = node
                .field_keys()
                .into_iter()
                .filter(|k| !identity_fields.contains(k))
                .collect();

            let groups = if remaining_fields.is_empty() {
                Vec::new()
            } else {
                match self.plan_remaining(run, node, &remaining_fields).await? {
                    Some(groups) => split_oversized(groups, max_fields),
                    None => return Ok(None),
                }
            };

            let level = levels
                .entry(node.level)
                .or_insert_with(|| LevelPlan::new(node.level));

            let name = format!("{} Identity", node.name);
            level.identities.push(IdentityGroup {
                key: unique_key(&name, &node.name, &mut used_keys),
                name,
                object_type: node.name.clone(),
                parent_type: node.parent_type.clone(),
                is_array: node.is_array,
                fragment_selector: from_node(node, &nodes, &identity_fields),
                identity_fields,
                skim_fields,
                description: identity.description.clone(),
            });

            for group in groups {
                level.remaining.push(RemainingGroup {
                    key: unique_key(&group.name, &node.name, &mut used_keys),
                    object_type: node.name.clone(),
                    fragment_selector: from_node(node, &nodes, &group.fields),
                    search_mode: group
                        .search_mode
                        .as_deref()
                        .map(SearchMode::from_label)
                        .unwrap_or_default(),
                    name: group.name,
                    fields: group.fields,
                    description: group.description,
                });
            }
        }

        let plan = ExtractionPlan {
            levels: levels.into_values().collect(),
        };

        task.plan_cache = Some(PlanCacheEntry {
            plan: plan.clone(),
            cache_key: plan_fingerprint(&task.schema, self.config),
            generated_at: Utc::now(),
        });
        self.store.save_task(task).await?;

        info!(
            levels = plan.levels.len(),
            categories = plan.categories().len(),
            "Extraction plan compiled"
        );
        Ok(Some(plan))
    }

    /// Existing planning process for an object type, or a new one.
    async fn planning_process(&self, run: &Run, operation: Operation, node: &ObjectTypeNode) -> Result<Process> {
        let existing = self
            .store
            .processes_for_run(run.id, Some(operation))
            .await?
            .into_iter()
            .find(|p| p.meta.object_type.as_deref() == Some(node.name.as_str()));

        if let Some(process) = existing {
            return Ok(process);
        }

        let process = Process::new(run.id, operation).with_meta(ProcessMeta {
            level: Some(node.level),
            object_type: Some(node.name.clone()),
            ..Default::default()
        });
        self.store.save_process(&process).await?;
        Ok(process)
    }

    async fn plan_identity(&self, run: &Run, node: &ObjectTypeNode) -> Result<Option<IdentityPlanResponse>> {
        let mut process = self.planning_process(run, Operation::PlanIdentify, node).await?;
        if process.is_complete() {
            if let Some(result) = process.meta.result.clone() {
                return Ok(Some(serde_json::from_value(result)?));
            }
        }

        process.start();
        let request = InferenceRequest::new(
            Operation::PlanIdentify,
            format_plan_identify_prompt(node, self.config.group_max_points),
            response_schema::<IdentityPlanResponse>(),
            self.config.timeout(),
        );
        let response = submit_bounded(self.inference, request).await;
        let failure = response.failure_message();

        let parsed = match response.into_json() {
            Some(json) => serde_json::from_value::<IdentityPlanResponse>(json)
                .map_err(|e| format!("unparseable identity plan: {}", e)),
            None => Err(failure),
        };

        match parsed {
            Ok(answer) => {
                process.meta.result = Some(serde_json::to_value(&answer)?);
                process.complete();
                self.store.save_process(&process).await?;
                debug!(object_type = %node.name, fields = ?answer.identity_fields, "Identity fields planned");
                Ok(Some(answer))
            }
            Err(message) => {
                warn!(object_type = %node.name, error = %message, "Identity planning failed");
                process.fail(message);
                self.store.save_process(&process).await?;
                Ok(None)
            }
        }
    }

    async fn plan_remaining(
        &self,
        run: &Run,
        node: &ObjectTypeNode,
        fields: &[String],
    ) -> Result<Option<Vec<PlannedGroupResponse>>> {
        let mut process = self.planning_process(run, Operation::PlanRemaining, node).await?;
        if process.is_complete() {
            if let Some(result) = process.meta.result.clone() {
                let answer: RemainingPlanResponse = serde_json::from_value(result)?;
                return Ok(Some(answer.groups));
            }
        }

        process.start();
        process.meta.attempt_history.clear();

        let mut accepted: Vec<PlannedGroupResponse> = Vec::new();
        let mut requested = fields.to_vec();

        for attempt in 1..=MAX_COVERAGE_ATTEMPTS {
            let request = InferenceRequest::new(
                Operation::PlanRemaining,
                format_plan_remaining_prompt(node, &requested, self.config.group_max_points, attempt),
                response_schema::<RemainingPlanResponse>(),
                self.config.timeout(),
            );
            let response = submit_bounded(self.inference, request).await;
            let failure = response.failure_message();

            let answer = match response.into_json() {
                Some(json) => serde_json::from_value::<RemainingPlanResponse>(json)
                    .map_err(|e| format!("unparseable remaining plan: {}", e)),
                None => Err(failure),
            };
            let answer = match answer {
                Ok(answer) => answer,
                Err(message) => {
                    warn!(object_type = %node.name, attempt, error = %message, "Remaining planning failed");
                    process.fail(message);
                    self.store.save_process(&process).await?;
                    return Ok(None);
                }
            };

            let check = check_coverage(&requested, &answer.groups);
            process.meta.attempt_history.push(CoverageAttempt {
                attempt,
                requested_fields: requested.clone(),
                groups_returned: answer
                    .groups
                    .iter()
                    .map(|g| PlannedGroup {
                        name: g.name.clone(),
                        fields: g.fields.clone(),
                    })
                    .collect(),
                covered_fields: check.covered.clone(),
                missing_fields: check.missing.clone(),
                duplicate_fields: check.duplicates.clone(),
            });
            if !check.duplicates.is_empty() {
                debug!(object_type = %node.name, duplicates = ?check.duplicates, "Dropped repeated fields");
            }

            accepted.extend(check.groups);

            if check.missing.is_empty() {
                process.meta.result = Some(serde_json::to_value(RemainingPlanResponse {
                    groups: accepted.clone(),
                })?);
                process.complete();
                self.store.save_process(&process).await?;
                info!(object_type = %node.name, groups = accepted.len(), attempts = attempt, "Remaining fields planned");
                return Ok(Some(accepted));
            }

            warn!(object_type = %node.name, attempt, missing = ?check.missing, "Remaining plan left fields uncovered");
            requested = check.missing;
        }

        let error = ValidationError::CoverageIncomplete {
            object_type: node.name.clone(),
            attempts: MAX_COVERAGE_ATTEMPTS,
            missing: requested,
        };
        process.fail(error.to_string());
        self.store.save_process(&process).await?;
        Err(error.into())
    }
}
