//! Rollup of extraction artifacts into the final nested object graph.

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::naming::to_snake_case;
use crate::traits::store::Store;
use crate::types::{
    artifact::Artifact,
    object::{OBJECT_ID_KEY, OBJECT_TYPE_KEY},
    rollup::{RollupOutput, RollupSummary},
    run::Run,
};

/// One object merged from every artifact that mentions it.
#[derive(Debug, Clone)]
struct ObjectRecord {
    object_type: String,
    fields: Map<String, Value>,
    parent_id: Option<Uuid>,
    relationship_key: String,
    is_array: bool,
}

/// The leaf object of hierarchical content.
///
/// `{"provider": {"diagnoses": [{"_id": .., "code": ..}]}}` yields the
/// diagnosis. Descent stops at the first object carrying an `_id` or having
/// more than one key.
pub fn leaf_content(json: &Value) -> Option<Map<String, Value>> {
    let mut current = json;
    loop {
        match current {
            Value::Array(items) => current = items.first()?,
            Value::Object(obj) => {
                if obj.contains_key(OBJECT_ID_KEY) || obj.len() != 1 {
                    return Some(obj.clone());
                }
                match obj.values().next() {
                    Some(next @ (Value::Object(_) | Value::Array(_))) => current = next,
                    _ => return Some(obj.clone()),
                }
            }
            _ => return None,
        }
    }
}

/// Merge extraction artifacts (in any order) into one record per object.
///
/// Fields follow "last non-null write wins" in artifact creation order.
fn merge_records(artifacts: &[Artifact]) -> IndexMap<Uuid, ObjectRecord> {
    let mut ordered: Vec<&Artifact> = artifacts.iter().collect();
    ordered.sort_by_key(|a| a.created_at);

    let mut records: IndexMap<Uuid, ObjectRecord> = IndexMap::new();
    for artifact in ordered {
        let Some(provenance) = &artifact.meta.provenance else {
            continue;
        };
        let content = artifact
            .json_content
            .as_ref()
            .and_then(leaf_content)
            .unwrap_or_default();

        let record = records
            .entry(provenance.object_id)
            .or_insert_with(|| ObjectRecord {
                object_type: provenance.object_type.clone(),
                fields: Map::new(),
                parent_id: None,
                relationship_key: to_snake_case(&provenance.object_type),
                is_array: false,
            });

        if provenance.parent_id.is_some() {
            record.parent_id = provenance.parent_id;
        }
        if let Some(key) = &provenance.relationship_key {
            record.relationship_key = key.clone();
        }
        record.is_array = provenance.is_array_type;

        for (key, value) in content {
            if value.is_null() || key == OBJECT_ID_KEY || key == OBJECT_TYPE_KEY {
                continue;
            }
            record.fields.insert(key, value);
        }
    }
    records
}

struct GraphBuilder<'r> {
    records: &'r IndexMap<Uuid, ObjectRecord>,
    children: IndexMap<Uuid, Vec<Uuid>>,
    visited: HashSet<Uuid>,
}

impl<'r> GraphBuilder<'r> {
    fn new(records: &'r IndexMap<Uuid, ObjectRecord>) -> Self {
        let mut children: IndexMap<Uuid, Vec<Uuid>> = IndexMap::new();
        for (id, record) in records {
            if let Some(parent_id) = record.parent_id.filter(|p| records.contains_key(p)) {
                children.entry(parent_id).or_default().push(*id);
            }
        }
        Self {
            records,
            children,
            visited: HashSet::new(),
        }
    }

    fn is_root(&self, id: &Uuid) -> bool {
        self.records
            .get(id)
            .and_then(|r| r.parent_id)
            .map_or(true, |p| !self.records.contains_key(&p))
    }

    fn render(&mut self, id: Uuid) -> Option<Value> {
        if !self.visited.insert(id) {
            return None;
        }
        let record = self.records.get(&id)?;

        let mut object = Map::new();
        object.insert(OBJECT_ID_KEY.to_string(), Value::String(id.to_string()));
        object.insert(OBJECT_TYPE_KEY.to_string(), Value::String(record.object_type.clone()));
        for (key, value) in &record.fields {
            object.insert(key.clone(), value.clone());
        }

        let child_ids = self.children.get(&id).cloned().unwrap_or_default();
        for child_id in child_ids {
            let Some(child) = self.render(child_id) else {
                continue;
            };
            let Some(child_record) = self.records.get(&child_id) else {
                continue;
            };
            let key = child_record.relationship_key.clone();

            if child_record.is_array {
                match object.get_mut(&key) {
                    Some(Value::Array(items)) => items.push(child),
                    _ => {
                        object.insert(key, Value::Array(vec![child]));
                    }
                }
            } else {
                if object.contains_key(&key) {
                    warn!(parent_id = %id, relationship = %key, "Multiple children on a single relationship, keeping the last");
                }
                object.insert(key, child);
            }
        }

        Some(Value::Object(object))
    }

    fn build(mut self) -> Vec<Value> {
        let ids: Vec<Uuid> = self.records.keys().copied().collect();
        let mut objects = Vec::new();

        let roots: Vec<Uuid> = ids.iter().copied().filter(|id| self.is_root(id)).collect();
        for id in roots {
            if let Some(object) = self.render(id) {
                objects.push(object);
            }
        }

        // Anything left is only reachable through a parent cycle.
        for id in &ids {
            if self.visited.contains(id) {
                continue;
            }
            warn!(object_id = %id, "Object only reachable through a cycle, emitting as root");
            if let Some(object) = self.render(*id) {
                objects.push(object);
            }
        }

        objects
    }
}

/// Build the rollup output from a set of extraction artifacts.
pub fn build_rollup(artifacts: &[Artifact]) -> RollupOutput {
    let records = merge_records(artifacts);

    let mut summary = RollupSummary {
        total_objects: records.len(),
        by_type: IndexMap::new(),
    };
    for record in records.values() {
        *summary.by_type.entry(record.object_type.clone()).or_insert(0) += 1;
    }

    RollupOutput {
        extracted_at: Utc::now(),
        objects: GraphBuilder::new(&records).build(),
        summary,
    }
}

/// Merges a run's extraction artifacts and writes the object graph.
pub struct RollupEngine<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S> RollupEngine<'a, S>
where
    S: Store + ?Sized,
{
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Every extraction artifact under `root_id`, at any depth.
    pub async fn collect_extraction_artifacts(&self, root_id: Uuid) -> Result<Vec<Artifact>> {
        let mut found = Vec::new();
        let mut seen = HashSet::from([root_id]);
        let mut queue = vec![root_id];

        while let Some(parent_id) = queue.pop() {
            for child in self.store.children(parent_id).await? {
                if !seen.insert(child.id) {
                    continue;
                }
                queue.push(child.id);
                if child.meta.operation().is_some_and(|op| op.is_extraction()) {
                    found.push(child);
                }
            }
        }

        Ok(found)
    }

    /// Roll the run up into its rollup artifact (or the output artifact).
    ///
    /// A target that already holds JSON is left alone unless `force` is set;
    /// `None` is returned in that case.
    #[instrument(skip(self, run), fields(run_id = %run.id))]
    pub async fn rollup(&self, run: &Run, force: bool) -> Result<Option<RollupOutput>> {
        let target_id = run.rollup_artifact_id.unwrap_or(run.output_artifact_id);
        let mut target = self.store.require_artifact(target_id).await?;

        if target.json_content.is_some() && !force {
            debug!(artifact_id = %target_id, "Rollup target already populated");
            return Ok(None);
        }

        let artifacts = self.collect_extraction_artifacts(run.output_artifact_id).await?;
        let output = build_rollup(&artifacts);

        target.json_content = Some(serde_json::to_value(&output)?);
        self.store.save_artifact(&target).await?;

        info!(
            artifacts = artifacts.len(),
            total_objects = output.summary.total_objects,
            roots = output.objects.len(),
            "Rollup written"
        );
        Ok(Some(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryStore;
    use crate::testing::{sample_schema, seed_run};
    use crate::traits::store::ArtifactStore;
    use crate::types::{artifact::Provenance, object::ResolvedObject, process::Operation};
    use chrono::Duration;
    use serde_json::json;

    struct Fixture {
        team_id: Uuid,
        clock: chrono::DateTime<Utc>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                team_id: Uuid::now_v7(),
                clock: Utc::now(),
            }
        }

        fn artifact(
            &mut self,
            object_id: Uuid,
            object_type: &str,
            parent_id: Option<Uuid>,
            relationship_key: Option<&str>,
            is_array: bool,
            content: Value,
        ) -> Artifact {
            self.clock += Duration::seconds(1);
            let mut artifact = Artifact::new(self.team_id, object_type).with_json(content);
            artifact.created_at = self.clock;
            artifact.meta.provenance = Some(Provenance {
                operation: Operation::ExtractIdentity,
                process_id: Uuid::now_v7(),
                object_id,
                object_type: object_type.to_string(),
                parent_id,
                parent_type: None,
                relationship_key: relationship_key.map(str::to_string),
                is_array_type: is_array,
                level: 0,
                identity_group: None,
                extraction_group: None,
                search_mode: None,
                search_query: None,
                was_existing: None,
                match_id: None,
            });
            artifact
        }
    }

    #[test]
    fn test_leaf_content_descends_nesting() {
        let nested = json!({"provider": {"diagnoses": [{"_id": "x", "code": "J45"}]}});
        assert_eq!(leaf_content(&nested).unwrap()["code"], "J45");

        let flat = json!({"name": "Dr. Smith", "phone": "555"});
        assert_eq!(leaf_content(&flat).unwrap().len(), 2);

        assert!(leaf_content(&json!("text")).is_none());
    }

    #[test]
    fn test_last_non_null_write_wins() {
        let mut fx = Fixture::new();
        let id = Uuid::now_v7();
        let first = fx.artifact(id, "Provider", None, None, false, json!({"provider": {"_id": id, "name": "Smith", "phone": "111"}}));
        let second = fx.artifact(id, "Provider", None, None, false, json!({"provider": {"phone": "222", "name": null}}));

        // Creation order decides, not slice order.
        let output = build_rollup(&[second, first]);
        assert_eq!(output.summary.total_objects, 1);
        assert_eq!(output.objects.len(), 1);
        assert_eq!(output.objects[0]["name"], "Smith");
        assert_eq!(output.objects[0]["phone"], "222");
        assert_eq!(output.objects[0]["_type"], "Provider");
        assert_eq!(output.objects[0]["_id"], id.to_string());
    }

    #[test]
    fn test_schema_fields_named_id_and_type_survive_merge() {
        let mut fx = Fixture::new();
        let object = ResolvedObject::new(fx.team_id, "Diagnosis")
            .with_field("type", json!("Chronic"))
            .with_field("id", json!("MRN-42"));
        let artifact = fx.artifact(
            object.id,
            "Diagnosis",
            None,
            None,
            false,
            json!({"diagnosis": Value::Object(object.snapshot())}),
        );

        let output = build_rollup(&[artifact]);
        let rolled = &output.objects[0];
        assert_eq!(rolled["type"], "Chronic");
        assert_eq!(rolled["id"], "MRN-42");
        assert_eq!(rolled["_type"], "Diagnosis");
        assert_eq!(rolled["_id"], object.id.to_string());
    }

    #[test]
    fn test_cardinality_follows_declared_relationship() {
        let mut fx = Fixture::new();
        let provider = Uuid::now_v7();
        let diagnosis = Uuid::now_v7();
        let office_a = Uuid::now_v7();
        let office_b = Uuid::now_v7();

        let artifacts = vec![
            fx.artifact(provider, "Provider", None, None, false, json!({"name": "Smith"})),
            fx.artifact(diagnosis, "Diagnosis", Some(provider), Some("diagnoses"), true, json!({"code": "J45"})),
            fx.artifact(office_a, "Office", Some(provider), None, false, json!({"city": "Austin"})),
            fx.artifact(office_b, "Office", Some(provider), None, false, json!({"city": "Boston"})),
        ];

        let output = build_rollup(&artifacts);
        let root = &output.objects[0];
        assert_eq!(output.objects.len(), 1);
        assert_eq!(root["diagnoses"].as_array().unwrap().len(), 1);
        assert_eq!(root["office"]["city"], "Boston");
        assert_eq!(output.summary.by_type["Office"], 2);
        assert_eq!(output.summary.total_objects, 4);
    }

    #[test]
    fn test_cycle_members_emitted_once() {
        let mut fx = Fixture::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let artifacts = vec![
            fx.artifact(a, "Node", Some(b), Some("child"), false, json!({"label": "a"})),
            fx.artifact(b, "Node", Some(a), Some("child"), false, json!({"label": "b"})),
        ];

        let output = build_rollup(&artifacts);
        assert_eq!(output.objects.len(), 1);
        assert_eq!(output.objects[0]["label"], "a");
        assert_eq!(output.objects[0]["child"]["label"], "b");
        assert!(output.objects[0]["child"].get("child").is_none());
    }

    #[tokio::test]
    async fn test_rollup_collects_nested_artifacts_and_respects_force() {
        let store = MemoryStore::new();
        let (_task, run) = seed_run(&store, sample_schema(), &["page"]).await;
        let page = store.children(run.output_artifact_id).await.unwrap().remove(0);

        let mut fx = Fixture::new();
        let provider = Uuid::now_v7();
        let identity = fx
            .artifact(provider, "Provider", None, Some("provider"), false, json!({"provider": {"name": "Smith"}}))
            .with_parent(page.id);
        let remaining = fx
            .artifact(provider, "Provider", None, Some("provider"), false, json!({"provider": {"phone": "555"}}))
            .with_parent(identity.id);
        store.save_artifact(&identity).await.unwrap();
        store.save_artifact(&remaining).await.unwrap();

        let engine = RollupEngine::new(&store);
        let output = engine.rollup(&run, false).await.unwrap().unwrap();
        assert_eq!(output.objects[0]["name"], "Smith");
        assert_eq!(output.objects[0]["phone"], "555");

        assert!(engine.rollup(&run, false).await.unwrap().is_none());
        assert!(engine.rollup(&run, true).await.unwrap().is_some());

        let target = store.require_artifact(run.output_artifact_id).await.unwrap();
        assert_eq!(target.json_content.unwrap()["summary"]["total_objects"], 1);
    }
}
