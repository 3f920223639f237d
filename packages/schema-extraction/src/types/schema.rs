//! Object-type hierarchy and fragment selector types.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A scalar (leaf) field of an object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleField {
    /// Property key in the schema
    pub key: String,

    /// Human-readable title (falls back to the Title-Cased key)
    pub title: String,

    /// Schema description, if any
    #[serde(default)]
    pub description: Option<String>,

    /// Raw property schema (non-null branch)
    pub schema: serde_json::Value,
}

/// One object type in a schema's nesting hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectTypeNode {
    /// Type name (schema title or Title-Cased key)
    pub name: String,

    /// Snake-case property keys from the root, root key first
    pub path: Vec<String>,

    /// Nesting depth (0 = root)
    pub level: u32,

    /// Name of the enclosing object type
    pub parent_type: Option<String>,

    /// Declared as an array of objects in the schema
    pub is_array: bool,

    /// Scalar fields of this type, in declaration order
    pub simple_fields: Vec<SimpleField>,
}

impl ObjectTypeNode {
    /// Keys of all simple fields.
    pub fn field_keys(&self) -> Vec<String> {
        self.simple_fields.iter().map(|f| f.key.clone()).collect()
    }

    /// Look up a simple field by key.
    pub fn field(&self, key: &str) -> Option<&SimpleField> {
        self.simple_fields.iter().find(|f| f.key == key)
    }

    /// Property key under which this type nests in its parent.
    pub fn relationship_key(&self) -> Option<&str> {
        self.path.last().map(|s| s.as_str())
    }
}

/// Node kind in a fragment selector tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorType {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
}

impl SelectorType {
    /// Map a JSON-schema `type` name; unknown types read as strings.
    pub fn from_schema_type(name: &str) -> Self {
        match name {
            "object" => Self::Object,
            "array" => Self::Array,
            "number" => Self::Number,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            _ => Self::String,
        }
    }

    /// Whether this node can contain children.
    pub fn is_container(self) -> bool {
        matches!(self, Self::Object | Self::Array)
    }

    /// JSON-schema `type` name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }
}

/// A sub-tree of the schema naming what one group extracts and where it
/// nests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentSelector {
    #[serde(rename = "type")]
    pub kind: SelectorType,

    /// Leaf format hint (`date`, `date-time`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub children: IndexMap<String, FragmentSelector>,
}

impl FragmentSelector {
    /// A container node with no children yet.
    pub fn container(kind: SelectorType) -> Self {
        Self {
            kind,
            format: None,
            children: IndexMap::new(),
        }
    }

    /// A scalar leaf.
    pub fn leaf(kind: SelectorType, format: Option<String>) -> Self {
        Self {
            kind,
            format,
            children: IndexMap::new(),
        }
    }

    /// Add a child.
    pub fn with_child(mut self, key: impl Into<String>, child: FragmentSelector) -> Self {
        self.children.insert(key.into(), child);
        self
    }

    /// Whether this node is an object/array that has children.
    pub fn is_nested(&self) -> bool {
        self.kind.is_container() && !self.children.is_empty()
    }
}
