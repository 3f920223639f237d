//! Extraction plan types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::SearchMode;
use super::schema::FragmentSelector;

/// Fields that disambiguate one instance of an object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityGroup {
    pub name: String,

    /// Snake-cased name; classification category id
    pub key: String,

    pub object_type: String,

    /// Enclosing object type, if any
    #[serde(default)]
    pub parent_type: Option<String>,

    /// Whether the type is declared as an array in the schema
    #[serde(default)]
    pub is_array: bool,

    pub identity_fields: Vec<String>,

    /// Fields cheap to pick up during a coarse pass
    #[serde(default)]
    pub skim_fields: Vec<String>,

    pub fragment_selector: FragmentSelector,

    #[serde(default)]
    pub description: Option<String>,
}

/// A named group of non-identity fields extracted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemainingGroup {
    pub name: String,

    /// Snake-cased name; classification category id
    pub key: String,

    pub object_type: String,

    pub fields: Vec<String>,

    pub fragment_selector: FragmentSelector,

    pub search_mode: SearchMode,

    #[serde(default)]
    pub description: Option<String>,
}

impl RemainingGroup {
    /// A group with no fields only exists to identify objects.
    pub fn is_identification_only(&self) -> bool {
        self.fields.is_empty()
    }
}

/// All groups for one nesting level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelPlan {
    pub level: u32,
    pub identities: Vec<IdentityGroup>,
    pub remaining: Vec<RemainingGroup>,
}

impl LevelPlan {
    pub fn new(level: u32) -> Self {
        Self {
            level,
            identities: Vec::new(),
            remaining: Vec::new(),
        }
    }
}

/// A compiled multi-level extraction plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExtractionPlan {
    pub levels: Vec<LevelPlan>,
}

impl ExtractionPlan {
    /// Plan for a given level.
    pub fn level(&self, level: u32) -> Option<&LevelPlan> {
        self.levels.iter().find(|l| l.level == level)
    }

    /// Whether a level after `level` exists.
    pub fn has_level_after(&self, level: u32) -> bool {
        self.levels.iter().any(|l| l.level > level)
    }

    /// Every classification category: `(key, description)`, first
    /// occurrence wins.
    pub fn categories(&self) -> Vec<(String, String)> {
        let mut seen = std::collections::HashSet::new();
        let mut categories = Vec::new();

        for level in &self.levels {
            let identity = level
                .identities
                .iter()
                .map(|g| (&g.key, &g.description));
            let remaining = level
                .remaining
                .iter()
                .map(|g| (&g.key, &g.description));

            for (key, description) in identity.chain(remaining) {
                if seen.insert(key.clone()) {
                    categories.push((key.clone(), description.clone().unwrap_or_default()));
                }
            }
        }

        categories
    }

    /// Find an identity group by key.
    pub fn identity_group(&self, key: &str) -> Option<&IdentityGroup> {
        self.levels
            .iter()
            .flat_map(|l| l.identities.iter())
            .find(|g| g.key == key)
    }

    /// Find a remaining group by key.
    pub fn remaining_group(&self, key: &str) -> Option<&RemainingGroup> {
        self.levels
            .iter()
            .flat_map(|l| l.remaining.iter())
            .find(|g| g.key == key)
    }
}

/// A compiled plan stored on the task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCacheEntry {
    pub plan: ExtractionPlan,

    /// Fingerprint of schema + runner config the plan was built for
    pub cache_key: String,

    pub generated_at: DateTime<Utc>,
}
