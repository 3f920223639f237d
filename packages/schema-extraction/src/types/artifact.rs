//! Artifacts (tree-structured content) and source files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::config::SearchMode;
use super::process::Operation;

/// Where an extraction artifact came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub operation: Operation,
    pub process_id: Uuid,
    pub object_id: Uuid,
    pub object_type: String,

    #[serde(default)]
    pub parent_id: Option<Uuid>,

    #[serde(default)]
    pub parent_type: Option<String>,

    /// Key the object nests under in its parent
    #[serde(default)]
    pub relationship_key: Option<String>,

    /// Whether that relationship is declared as an array
    #[serde(default)]
    pub is_array_type: bool,

    pub level: u32,

    #[serde(default)]
    pub identity_group: Option<String>,

    #[serde(default)]
    pub extraction_group: Option<String>,

    #[serde(default)]
    pub search_mode: Option<SearchMode>,

    #[serde(default)]
    pub search_query: Option<serde_json::Value>,

    #[serde(default)]
    pub was_existing: Option<bool>,

    #[serde(default)]
    pub match_id: Option<Uuid>,
}

/// Artifact metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ArtifactMeta {
    /// category key -> membership
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub classification: BTreeMap<String, bool>,

    /// object type -> last object resolved from this artifact
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolved_objects: BTreeMap<String, Uuid>,

    #[serde(flatten)]
    pub provenance: Option<Provenance>,
}

impl ArtifactMeta {
    /// Whether every given category key has a classification value.
    pub fn is_classified_for<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> bool {
        let mut any = false;
        for key in keys {
            any = true;
            if !self.classification.contains_key(key) {
                return false;
            }
        }
        any
    }

    /// Membership in a category (unclassified reads as false).
    pub fn in_category(&self, key: &str) -> bool {
        self.classification.get(key).copied().unwrap_or(false)
    }

    /// The operation that produced this artifact, if it is an extraction.
    pub fn operation(&self) -> Option<Operation> {
        self.provenance.as_ref().map(|p| p.operation)
    }
}

/// A tree-structured unit of content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,

    /// Owning artifact
    #[serde(default)]
    pub parent_artifact_id: Option<Uuid>,

    /// Underlying source file (carries the classification cache)
    #[serde(default)]
    pub source_file_id: Option<Uuid>,

    #[serde(default)]
    pub json_content: Option<serde_json::Value>,

    #[serde(default)]
    pub text_content: Option<String>,

    #[serde(default)]
    pub meta: ArtifactMeta,

    /// Ordering among siblings
    #[serde(default)]
    pub position: u32,

    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(team_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            team_id,
            name: name.into(),
            parent_artifact_id: None,
            source_file_id: None,
            json_content: None,
            text_content: None,
            meta: ArtifactMeta::default(),
            position: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_artifact_id = Some(parent_id);
        self
    }

    pub fn with_source_file(mut self, source_file_id: Uuid) -> Self {
        self.source_file_id = Some(source_file_id);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text_content = Some(text.into());
        self
    }

    pub fn with_json(mut self, json: serde_json::Value) -> Self {
        self.json_content = Some(json);
        self
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }

    /// Content handed to the model: text, else serialized JSON.
    pub fn content_for_prompt(&self) -> String {
        match (&self.text_content, &self.json_content) {
            (Some(text), _) => text.clone(),
            (None, Some(json)) => json.to_string(),
            (None, None) => String::new(),
        }
    }
}

/// A cached classification for one boolean schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationCacheEntry {
    pub schema_hash: String,
    pub classified_at: DateTime<Utc>,
    pub result: BTreeMap<String, bool>,
}

impl ClassificationCacheEntry {
    pub fn new(schema_hash: impl Into<String>, result: BTreeMap<String, bool>) -> Self {
        Self {
            schema_hash: schema_hash.into(),
            classified_at: Utc::now(),
            result,
        }
    }
}

/// The file a page artifact was transcoded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: Uuid,
    pub name: String,

    /// schema hash -> cached classification
    #[serde(default)]
    pub classification_cache: BTreeMap<String, ClassificationCacheEntry>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            classification_cache: BTreeMap::new(),
        }
    }
}
