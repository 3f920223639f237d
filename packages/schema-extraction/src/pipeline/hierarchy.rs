//! Decompose a nested schema into object-type nodes.

use serde_json::{Map, Value};

use crate::naming::{title_case, to_snake_case};
use crate::types::schema::{ObjectTypeNode, SimpleField};

/// The `type` of a schema node, inferred from `properties`/`items` when not
/// declared.
pub fn schema_type(schema: &Value) -> Option<&str> {
    match schema.get("type") {
        Some(Value::String(t)) => Some(t.as_str()),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null"),
        _ if schema.get("properties").is_some() => Some("object"),
        _ if schema.get("items").is_some() => Some("array"),
        _ => None,
    }
}

/// Resolve a nullable union to its non-null branch.
///
/// Handles `type: ["object", "null"]` as well as `anyOf`/`oneOf` with a
/// `null` branch. Title and description of the outer schema are kept when
/// the branch has none.
pub fn non_null_branch(schema: &Value) -> Value {
    if let Some(Value::Array(types)) = schema.get("type") {
        let mut resolved = schema.clone();
        if let (Some(t), Some(obj)) = (
            types.iter().filter_map(Value::as_str).find(|t| *t != "null"),
            resolved.as_object_mut(),
        ) {
            obj.insert("type".to_string(), Value::String(t.to_string()));
        }
        return resolved;
    }

    let branches = schema
        .get("anyOf")
        .or_else(|| schema.get("oneOf"))
        .and_then(Value::as_array);

    if let Some(branches) = branches {
        let branch = branches
            .iter()
            .find(|b| b.get("type").and_then(Value::as_str) != Some("null"));

        if let Some(branch) = branch {
            let mut resolved = non_null_branch(branch);
            if let Some(obj) = resolved.as_object_mut() {
                for key in ["title", "description"] {
                    if !obj.contains_key(key) {
                        if let Some(v) = schema.get(key) {
                            obj.insert(key.to_string(), v.clone());
                        }
                    }
                }
            }
            return resolved;
        }
    }

    schema.clone()
}

fn properties(schema: &Value) -> Option<&Map<String, Value>> {
    schema
        .get("properties")
        .and_then(Value::as_object)
        .filter(|p| !p.is_empty())
}

fn str_field(schema: &Value, key: &str) -> Option<String> {
    schema
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// A property that opens a nested object type.
struct NestedType {
    key: String,
    schema: Value,
    is_array: bool,
    title: Option<String>,
}

/// Classify a property as a nested type, or `None` if it is a simple field.
fn nested_type(key: &str, property: &Value) -> Option<NestedType> {
    let property = non_null_branch(property);

    match schema_type(&property) {
        Some("object") if properties(&property).is_some() => Some(NestedType {
            key: key.to_string(),
            title: str_field(&property, "title"),
            schema: property,
            is_array: false,
        }),
        Some("array") => {
            let items = non_null_branch(property.get("items")?);
            if schema_type(&items) == Some("object") && properties(&items).is_some() {
                Some(NestedType {
                    key: key.to_string(),
                    title: str_field(&items, "title").or_else(|| str_field(&property, "title")),
                    schema: items,
                    is_array: true,
                })
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Ordered object-type nodes of a schema, root first, depth-first.
///
/// Arrays of primitives stay simple fields. A non-object root yields no
/// nodes.
pub fn extract_hierarchy(schema: &Value, fallback_name: &str) -> Vec<ObjectTypeNode> {
    let root = non_null_branch(schema);
    if schema_type(&root) != Some("object") {
        return Vec::new();
    }

    let name = str_field(&root, "name")
        .or_else(|| str_field(&root, "title"))
        .unwrap_or_else(|| fallback_name.to_string());
    let path = vec![to_snake_case(&name)];

    let mut nodes = Vec::new();
    collect(&root, name, path, None, false, &mut nodes);
    nodes
}

fn collect(
    schema: &Value,
    name: String,
    path: Vec<String>,
    parent_type: Option<String>,
    is_array: bool,
    nodes: &mut Vec<ObjectTypeNode>,
) {
    let mut simple_fields = Vec::new();
    let mut children = Vec::new();

    if let Some(props) = properties(schema) {
        for (key, property) in props {
            match nested_type(key, property) {
                Some(nested) => children.push(nested),
                None => {
                    let property = non_null_branch(property);
                    simple_fields.push(SimpleField {
                        key: key.clone(),
                        title: str_field(&property, "title").unwrap_or_else(|| title_case(key)),
                        description: str_field(&property, "description"),
                        schema: property,
                    });
                }
            }
        }
    }

    nodes.push(ObjectTypeNode {
        name: name.clone(),
        level: path.len().saturating_sub(1) as u32,
        path: path.clone(),
        parent_type,
        is_array,
        simple_fields,
    });

    for child in children {
        let child_name = child.title.unwrap_or_else(|| title_case(&child.key));
        let mut child_path = path.clone();
        child_path.push(to_snake_case(&child.key));
        collect(
            &child.schema,
            child_name,
            child_path,
            Some(name.clone()),
            child.is_array,
            nodes,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider_schema() -> Value {
        json!({
            "name": "Provider",
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "npi": {"type": "integer", "title": "NPI"},
                "languages": {"type": "array", "items": {"type": "string"}},
                "address": {
                    "type": ["object", "null"],
                    "properties": {
                        "street": {"type": "string"},
                        "city": {"type": "string"}
                    }
                },
                "diagnoses": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "code": {"type": "string"},
                            "diagnosed_on": {"type": "string", "format": "date"},
                            "treatments": {
                                "type": "array",
                                "items": {"type": "object", "properties": {"drug": {"type": "string"}}}
                            }
                        }
                    }
                },
                "billing": {
                    "anyOf": [
                        {"type": "null"},
                        {"type": "object", "properties": {"amount": {"type": "number"}}}
                    ]
                }
            }
        })
    }

    #[test]
    fn test_hierarchy_is_depth_first_in_declaration_order() {
        let nodes = extract_hierarchy(&provider_schema(), "Fallback");
        let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["Provider", "Address", "Diagnoses", "Treatments", "Billing"]);

        let root = &nodes[0];
        assert_eq!(root.level, 0);
        assert_eq!(root.path, ["provider"]);
        assert_eq!(root.field_keys(), ["name", "npi", "languages"]);
        assert_eq!(root.field("npi").unwrap().title, "NPI");

        let treatments = &nodes[3];
        assert_eq!(treatments.level, 2);
        assert_eq!(treatments.path, ["provider", "diagnoses", "treatments"]);
        assert_eq!(treatments.parent_type.as_deref(), Some("Diagnoses"));
        assert!(treatments.is_array);
    }

    #[test]
    fn test_nullable_unions_resolve_to_object() {
        let nodes = extract_hierarchy(&provider_schema(), "Fallback");

        let address = nodes.iter().find(|n| n.name == "Address").unwrap();
        assert!(!address.is_array);
        assert_eq!(address.level, 1);

        let billing = nodes.iter().find(|n| n.name == "Billing").unwrap();
        assert_eq!(billing.field_keys(), ["amount"]);
    }

    #[test]
    fn test_root_name_fallbacks() {
        let titled = json!({"title": "Claim", "type": "object", "properties": {"id": {"type": "string"}}});
        assert_eq!(extract_hierarchy(&titled, "Fallback")[0].name, "Claim");

        let anonymous = json!({"type": "object", "properties": {"id": {"type": "string"}}});
        assert_eq!(extract_hierarchy(&anonymous, "Medical Record")[0].path, ["medical_record"]);
    }

    #[test]
    fn test_non_object_root_is_empty() {
        assert!(extract_hierarchy(&json!({"type": "string"}), "x").is_empty());
        assert!(extract_hierarchy(&json!({"type": "array", "items": {"type": "object"}}), "x").is_empty());
    }

    #[test]
    fn test_schema_type_infers_from_shape() {
        assert_eq!(schema_type(&json!({"properties": {}})), Some("object"));
        assert_eq!(schema_type(&json!({"type": ["null", "integer"]})), Some("integer"));
        assert_eq!(schema_type(&json!({})), None);
    }
}
