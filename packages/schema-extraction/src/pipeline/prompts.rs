//! Prompts for every inference call in the pipeline.
//!
//! Only the structure matters to the engines: each prompt names its inputs
//! and the response is constrained by a JSON schema sent alongside it.

use serde_json::Value;

use crate::types::schema::ObjectTypeNode;

/// Prompt for choosing identity and skim fields of one object type.
pub const PLAN_IDENTIFY_PROMPT: &str = r#"You are planning data extraction for the object type "{object_type}".

Choose the IDENTITY fields: the smallest set of fields that tells one instance of
this type apart from every other instance (for example a name plus a date, or an
identifier number). Choose at most {max_fields} fields.

Also choose SKIM fields: fields that are cheap to pick up while scanning pages for
identities.

Only use field keys from this list:
{fields}

Respond with JSON matching the provided schema."#;

/// Prompt for grouping the remaining (non-identity) fields.
pub const PLAN_REMAINING_PROMPT: &str = r#"You are planning data extraction for the object type "{object_type}".

Group the following fields into named extraction groups. Fields that are usually
found together on the same page belong in the same group. Each group may hold at
most {max_fields} fields, and every field must appear in exactly one group.

For each group choose a search_mode:
- "skim": the values are likely found early; scanning a few pages is enough
- "exhaustive": the values may be spread across the whole document

Fields:
{fields}
{retry_section}
Respond with JSON matching the provided schema."#;

/// Prompt for classifying one page against every plan category.
pub const CLASSIFY_PROMPT: &str = r#"Decide which of the following categories the attached page contains
information about. Answer true or false for every category.

Categories:
{categories}

Respond with JSON matching the provided schema."#;

/// Prompt for extracting identities of one object type.
pub const EXTRACT_IDENTITY_PROMPT: &str = r#"Extract every "{object_type}" found in the attached content.

For each instance extract the identity fields:
{fields}
{parent_section}
For each instance also produce "_search_query": {search_query_help}

Leave a field null when the content does not state it. Do not guess.
Respond with JSON matching the provided schema."#;

/// Prompt for extracting remaining fields in one pass.
pub const EXTRACT_REMAINING_PROMPT: &str = r#"Fill in the "{group_name}" fields of this {object_type}:
{object}

Fields to extract:
{fields}

Use only the attached content. Leave a field null when it is not stated.
Respond with JSON matching the provided schema."#;

/// Prompt for one skim batch of remaining fields.
pub const SKIM_REMAINING_PROMPT: &str = r#"Fill in the "{group_name}" fields of this {object_type}:
{object}

Fields to extract:
{fields}

This is one batch of pages from a larger document. For every field give the value
found in these pages (or null) and a confidence from 1 (guess) to 5 (stated
explicitly). Respond with JSON matching the provided schema."#;

/// Prompt for deciding whether an extracted instance duplicates an existing
/// object.
pub const RESOLVE_DUPLICATE_PROMPT: &str = r#"An extraction produced this "{object_type}":
{extracted}

These existing records might describe the same real-world entity:
{candidates}

Decide whether the extracted data is a duplicate of exactly one existing record.
If it is, set is_duplicate to true and existing_object_id to that record's _id.
Otherwise set is_duplicate to false. Explain briefly and give a confidence from
0.0 to 1.0. Respond with JSON matching the provided schema."#;

/// Render field keys with titles and descriptions as a bullet list.
pub fn format_field_list(node: &ObjectTypeNode, keys: &[String]) -> String {
    keys.iter()
        .map(|key| match node.field(key) {
            Some(field) => match &field.description {
                Some(description) => format!("- {} ({}): {}", key, field.title, description),
                None => format!("- {} ({})", key, field.title),
            },
            None => format!("- {}", key),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format the identity planning prompt.
pub fn format_plan_identify_prompt(node: &ObjectTypeNode, max_fields: usize) -> String {
    PLAN_IDENTIFY_PROMPT
        .replace("{object_type}", &node.name)
        .replace("{max_fields}", &max_fields.to_string())
        .replace("{fields}", &format_field_list(node, &node.field_keys()))
}

/// Format the remaining-field planning prompt.
///
/// On retries `fields` holds only what the last answer left out.
pub fn format_plan_remaining_prompt(
    node: &ObjectTypeNode,
    fields: &[String],
    max_fields: usize,
    attempt: usize,
) -> String {
    let retry_section = if attempt > 1 {
        format!(
            "\nAttempt {}: a previous answer left these fields ungrouped. Group ALL of them.\n",
            attempt
        )
    } else {
        String::new()
    };

    PLAN_REMAINING_PROMPT
        .replace("{object_type}", &node.name)
        .replace("{max_fields}", &max_fields.to_string())
        .replace("{fields}", &format_field_list(node, fields))
        .replace("{retry_section}", &retry_section)
}

/// Format the classification prompt.
pub fn format_classify_prompt(categories: &[(String, String)]) -> String {
    let list = categories
        .iter()
        .map(|(key, description)| {
            if description.is_empty() {
                format!("- {}", key)
            } else {
                format!("- {}: {}", key, description)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    CLASSIFY_PROMPT.replace("{categories}", &list)
}

/// Format the identity extraction prompt.
pub fn format_extract_identity_prompt(
    object_type: &str,
    fields: &[String],
    parent: Option<(&str, &Value)>,
    is_array: bool,
) -> String {
    let parent_section = match parent {
        Some((parent_type, snapshot)) => format!(
            "\nOnly extract instances that belong to this {}:\n{}\n",
            parent_type, snapshot
        ),
        None => String::new(),
    };

    let search_query_help = if is_array {
        "an array of search queries, loosest first and most specific last. Each query is an object mapping field keys to a value, a LIKE pattern with % wildcards, or an array of keywords."
    } else {
        "one search query object mapping field keys to a value, a LIKE pattern with % wildcards, or an array of keywords."
    };

    EXTRACT_IDENTITY_PROMPT
        .replace("{object_type}", object_type)
        .replace(
            "{fields}",
            &fields
                .iter()
                .map(|f| format!("- {}", f))
                .collect::<Vec<_>>()
                .join("\n"),
        )
        .replace("{parent_section}", &parent_section)
        .replace("{search_query_help}", search_query_help)
}

fn bullet_list(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| format!("- {}", f))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format the single-pass remaining extraction prompt.
pub fn format_extract_remaining_prompt(
    group_name: &str,
    object_type: &str,
    object: &Value,
    fields: &[String],
) -> String {
    EXTRACT_REMAINING_PROMPT
        .replace("{group_name}", group_name)
        .replace("{object_type}", object_type)
        .replace("{object}", &pretty(object))
        .replace("{fields}", &bullet_list(fields))
}

/// Format one skim batch prompt.
pub fn format_skim_remaining_prompt(
    group_name: &str,
    object_type: &str,
    object: &Value,
    fields: &[String],
) -> String {
    SKIM_REMAINING_PROMPT
        .replace("{group_name}", group_name)
        .replace("{object_type}", object_type)
        .replace("{object}", &pretty(object))
        .replace("{fields}", &bullet_list(fields))
}

/// Format the duplicate resolution prompt.
pub fn format_resolve_duplicate_prompt(
    object_type: &str,
    extracted: &Value,
    candidates: &[Value],
) -> String {
    let candidates = candidates.iter().map(pretty).collect::<Vec<_>>().join("\n\n");

    RESOLVE_DUPLICATE_PROMPT
        .replace("{object_type}", object_type)
        .replace("{extracted}", &pretty(extracted))
        .replace("{candidates}", &candidates)
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
