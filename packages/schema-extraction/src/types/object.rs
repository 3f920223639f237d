//! Resolved domain objects and duplicate-resolution results.

use chrono::{DateTime, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::pipeline::field_types::parse_date;

/// Snapshot key for the object's own id. Schema fields named `id` keep theirs.
pub const OBJECT_ID_KEY: &str = "_id";

/// Snapshot key for the object's type.
pub const OBJECT_TYPE_KEY: &str = "_type";

/// Core columns every resolved object carries.
pub const CORE_FIELDS: &[&str] = &["name", "date", "description", "url"];

/// A custom attribute on a resolved object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectAttribute {
    pub name: String,

    /// Structured representation (preferred)
    #[serde(default)]
    pub json_value: Option<Value>,

    /// Textual representation
    #[serde(default)]
    pub text_value: Option<String>,
}

impl ObjectAttribute {
    /// The attribute value, preferring structured over textual.
    pub fn value(&self) -> Option<Value> {
        self.json_value
            .clone()
            .or_else(|| self.text_value.clone().map(Value::String))
    }
}

/// A persisted domain object representing one real-world entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedObject {
    pub id: Uuid,
    pub team_id: Uuid,

    #[serde(rename = "type")]
    pub object_type: String,

    pub name: Option<String>,
    pub date: Option<NaiveDate>,
    pub description: Option<String>,
    pub url: Option<String>,

    #[serde(default)]
    pub attributes: Vec<ObjectAttribute>,

    /// Parent object scope
    #[serde(default)]
    pub root_object_id: Option<Uuid>,

    #[serde(default)]
    pub schema_definition_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResolvedObject {
    pub fn new(team_id: Uuid, object_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            team_id,
            object_type: object_type.into(),
            name: None,
            date: None,
            description: None,
            url: None,
            attributes: Vec::new(),
            root_object_id: None,
            schema_definition_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_root_object(mut self, root_object_id: Option<Uuid>) -> Self {
        self.root_object_id = root_object_id;
        self
    }

    pub fn with_schema_definition(mut self, schema_definition_id: Option<Uuid>) -> Self {
        self.schema_definition_id = schema_definition_id;
        self
    }

    /// Builder form of [`set_field`](Self::set_field).
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.set_field(key, value);
        self
    }

    /// Read a field from a core column or a custom attribute.
    pub fn field(&self, key: &str) -> Option<Value> {
        match key {
            "name" => self.name.clone().map(Value::String),
            "description" => self.description.clone().map(Value::String),
            "url" => self.url.clone().map(Value::String),
            "date" => self
                .date
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .or_else(|| self.attribute(key).and_then(|a| a.value())),
            _ => self.attribute(key).and_then(|a| a.value()),
        }
    }

    /// Write a field to a core column or a custom attribute.
    ///
    /// Null values are ignored. A `date` that cannot be parsed is kept as
    /// an attribute rather than dropped.
    pub fn set_field(&mut self, key: &str, value: Value) {
        if value.is_null() {
            return;
        }

        match key {
            "name" => self.name = Some(value_to_text(&value)),
            "description" => self.description = Some(value_to_text(&value)),
            "url" => self.url = Some(value_to_text(&value)),
            "date" => match parse_date(&value_to_text(&value)) {
                Some(date) => self.date = Some(date),
                None => self.set_attribute(key, value),
            },
            _ => self.set_attribute(key, value),
        }
        self.updated_at = Utc::now();
    }

    /// Apply a map of extracted fields.
    pub fn apply_fields(&mut self, fields: &Map<String, Value>) {
        for (key, value) in fields {
            self.set_field(key, value.clone());
        }
    }

    fn attribute(&self, name: &str) -> Option<&ObjectAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    fn set_attribute(&mut self, name: &str, value: Value) {
        let text_value = Some(value_to_text(&value));
        let json_value = match &value {
            Value::String(_) => None,
            _ => Some(value),
        };

        match self.attributes.iter_mut().find(|a| a.name == name) {
            Some(attr) => {
                attr.json_value = json_value;
                attr.text_value = text_value;
            }
            None => self.attributes.push(ObjectAttribute {
                name: name.to_string(),
                json_value,
                text_value,
            }),
        }
    }

    /// Current field snapshot handed to the model and written to
    /// provenance artifacts.
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(OBJECT_ID_KEY.to_string(), Value::String(self.id.to_string()));
        map.insert(OBJECT_TYPE_KEY.to_string(), Value::String(self.object_type.clone()));
        for key in CORE_FIELDS {
            map.insert(key.to_string(), self.field(key).unwrap_or(Value::Null));
        }
        for attr in &self.attributes {
            if let Some(value) = attr.value() {
                map.insert(attr.name.clone(), value);
            }
        }
        map
    }
}

/// Render a JSON value as plain text (strings unquoted).
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Whether a value counts as empty (null, blank string, empty array/object).
pub fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

/// Outcome of an LLM-assisted duplicate decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResolutionResult {
    pub is_duplicate: bool,

    /// The matching existing object, when `is_duplicate`
    #[serde(default)]
    pub existing_object_id: Option<Uuid>,

    pub explanation: String,

    /// 0.0 to 1.0
    pub confidence: f32,
}

/// Candidates found for an extracted instance.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    pub candidates: Vec<ResolvedObject>,

    /// Set when exactly one candidate is an unambiguous match
    pub exact_match_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_field_routes_core_columns_and_attributes() {
        let mut obj = ResolvedObject::new(Uuid::now_v7(), "Provider");
        obj.set_field("name", json!("Dr. Smith"));
        obj.set_field("date", json!("10/23/2017"));
        obj.set_field("npi", json!(1234567890));
        obj.set_field("specialty", json!("Cardiology"));
        obj.set_field("ignored", Value::Null);

        assert_eq!(obj.name.as_deref(), Some("Dr. Smith"));
        assert_eq!(obj.date, NaiveDate::from_ymd_opt(2017, 10, 23));
        assert_eq!(obj.field("date"), Some(json!("2017-10-23")));
        assert_eq!(obj.field("npi"), Some(json!(1234567890)));
        assert_eq!(obj.field("specialty"), Some(json!("Cardiology")));
        assert!(obj.field("ignored").is_none());
    }

    #[test]
    fn test_unparseable_date_is_kept_as_attribute() {
        let mut obj = ResolvedObject::new(Uuid::now_v7(), "Visit");
        obj.set_field("date", json!("sometime in spring"));

        assert!(obj.date.is_none());
        assert_eq!(obj.field("date"), Some(json!("sometime in spring")));
    }

    #[test]
    fn test_snapshot_prefers_structured_values() {
        let mut obj = ResolvedObject::new(Uuid::now_v7(), "Provider").with_name("Smith");
        obj.set_field("codes", json!(["A01", "B02"]));

        let snapshot = obj.snapshot();
        assert_eq!(snapshot[OBJECT_TYPE_KEY], "Provider");
        assert_eq!(snapshot["name"], "Smith");
        assert_eq!(snapshot["codes"], json!(["A01", "B02"]));
        assert_eq!(snapshot["url"], Value::Null);
    }

    #[test]
    fn test_schema_fields_never_overwrite_object_identity() {
        let obj = ResolvedObject::new(Uuid::now_v7(), "Diagnosis")
            .with_field("type", json!("Chronic"))
            .with_field("id", json!("MRN-42"));

        let snapshot = obj.snapshot();
        assert_eq!(snapshot[OBJECT_ID_KEY], obj.id.to_string());
        assert_eq!(snapshot[OBJECT_TYPE_KEY], "Diagnosis");
        assert_eq!(snapshot["id"], "MRN-42");
        assert_eq!(snapshot["type"], "Chronic");
    }

    #[test]
    fn test_is_blank() {
        assert!(is_blank(None));
        assert!(is_blank(Some(&json!(null))));
        assert!(is_blank(Some(&json!("   "))));
        assert!(is_blank(Some(&json!([]))));
        assert!(!is_blank(Some(&json!(0))));
        assert!(!is_blank(Some(&json!(false))));
    }
}
