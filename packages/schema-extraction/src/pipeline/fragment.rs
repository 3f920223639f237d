//! Fragment selectors: where a group's fields live in the schema tree.
//!
//! A selector for `Provider > Diagnoses` with fields `code, diagnosed_on`
//! looks like:
//!
//! ```text
//! {object, children: {provider: {object, children: {diagnoses: {array, children: {
//!     code: {string}, diagnosed_on: {string, format: date}
//! }}}}}}
//! ```

use crate::naming::title_case;
use crate::pipeline::hierarchy::schema_type;
use crate::types::schema::{FragmentSelector, ObjectTypeNode, SelectorType, SimpleField};

/// Property keys from the selector root down to its leaf container.
pub fn get_nesting_keys(selector: &FragmentSelector) -> Vec<String> {
    let mut keys = Vec::new();
    let mut current = selector;

    while let Some((key, child)) = current.children.iter().find(|(_, c)| c.is_nested()) {
        keys.push(key.clone());
        current = child;
    }

    keys
}

/// Title-Cased second-to-last nesting key, if the selector is nested more
/// than one level.
pub fn get_parent_type(selector: &FragmentSelector) -> Option<String> {
    let keys = get_nesting_keys(selector);
    if keys.len() <= 1 {
        return None;
    }
    keys.get(keys.len() - 2).map(|k| title_case(k))
}

/// The deepest container and the key it sits under (`None` for the
/// selector root itself).
pub fn leaf(selector: &FragmentSelector) -> (Option<String>, &FragmentSelector) {
    let mut key = None;
    let mut current = selector;

    while let Some((k, child)) = current.children.iter().find(|(_, c)| c.is_nested()) {
        key = Some(k.clone());
        current = child;
    }

    (key, current)
}

/// Scalar field keys of the leaf container.
pub fn leaf_field_keys(selector: &FragmentSelector) -> Vec<String> {
    let (_, leaf) = leaf(selector);
    leaf.children
        .iter()
        .filter(|(_, c)| !c.is_nested())
        .map(|(k, _)| k.clone())
        .collect()
}

fn field_selector(field: &SimpleField) -> FragmentSelector {
    let kind = schema_type(&field.schema)
        .map(SelectorType::from_schema_type)
        .unwrap_or(SelectorType::String);
    let format = field
        .schema
        .get("format")
        .and_then(|f| f.as_str())
        .map(str::to_string);
    FragmentSelector::leaf(kind, format)
}

/// Build the selector for a node restricted to `fields` (in that order).
///
/// `hierarchy` supplies the array/object kind of each ancestor on the
/// node's path. Unknown field keys are ignored.
pub fn from_node(
    node: &ObjectTypeNode,
    hierarchy: &[ObjectTypeNode],
    fields: &[String],
) -> FragmentSelector {
    let mut leaf_selector = FragmentSelector::container(if node.is_array {
        SelectorType::Array
    } else {
        SelectorType::Object
    });
    for key in fields {
        if let Some(field) = node.field(key) {
            leaf_selector = leaf_selector.with_child(key.clone(), field_selector(field));
        }
    }

    // Wrap from the node back up to the root.
    let mut selector = leaf_selector;
    for depth in (0..node.path.len()).rev() {
        let key = node.path[depth].clone();
        let parent_kind = if depth == 0 {
            SelectorType::Object
        } else {
            let prefix = &node.path[..depth];
            hierarchy
                .iter()
                .find(|n| n.path == prefix)
                .map(|n| {
                    if n.is_array {
                        SelectorType::Array
                    } else {
                        SelectorType::Object
                    }
                })
                .unwrap_or(SelectorType::Object)
        };
        selector = FragmentSelector::container(parent_kind).with_child(key, selector);
    }

    selector
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::hierarchy::extract_hierarchy;
    use serde_json::json;

    fn hierarchy() -> Vec<ObjectTypeNode> {
        extract_hierarchy(
            &json!({
                "name": "Provider",
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
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
                    }
                }
            }),
            "Provider",
        )
    }

    #[test]
    fn test_root_selector_has_single_nesting_key() {
        let nodes = hierarchy();
        let selector = from_node(&nodes[0], &nodes, &["name".to_string()]);

        assert_eq!(get_nesting_keys(&selector), ["provider"]);
        assert_eq!(get_parent_type(&selector), None);
        assert_eq!(leaf_field_keys(&selector), ["name"]);
    }

    #[test]
    fn test_nested_selector_resolves_parent_and_leaf() {
        let nodes = hierarchy();
        let diagnoses = &nodes[1];
        let selector = from_node(
            diagnoses,
            &nodes,
            &["code".to_string(), "diagnosed_on".to_string(), "missing".to_string()],
        );

        assert_eq!(get_nesting_keys(&selector), ["provider", "diagnoses"]);
        assert_eq!(get_parent_type(&selector).as_deref(), Some("Provider"));

        let (key, leaf) = leaf(&selector);
        assert_eq!(key.as_deref(), Some("diagnoses"));
        assert_eq!(leaf.kind, SelectorType::Array);
        assert_eq!(leaf.children["diagnosed_on"].format.as_deref(), Some("date"));
        assert_eq!(leaf_field_keys(&selector), ["code", "diagnosed_on"]);
    }

    #[test]
    fn test_intermediate_array_ancestors_keep_their_kind() {
        let nodes = hierarchy();
        let treatments = &nodes[2];
        let selector = from_node(treatments, &nodes, &["drug".to_string()]);

        let provider = &selector.children["provider"];
        let diagnoses = &provider.children["diagnoses"];
        assert_eq!(diagnoses.kind, SelectorType::Array);
        assert_eq!(get_parent_type(&selector).as_deref(), Some("Diagnoses"));
    }

    #[test]
    fn test_nesting_keys_stop_at_scalar_leaves() {
        let selector = FragmentSelector::container(SelectorType::Object)
            .with_child("name", FragmentSelector::leaf(SelectorType::String, None));
        assert!(get_nesting_keys(&selector).is_empty());
        assert_eq!(leaf(&selector).0, None);
    }
}
