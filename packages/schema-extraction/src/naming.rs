//! Case conversions shared by the planner, resolver and rollup.

/// Convert a label to snake_case.
///
/// Handles spaces, hyphens, punctuation and camelCase boundaries:
/// `"Provider Identity"` and `"providerIdentity"` both become
/// `"provider_identity"`.
pub fn to_snake_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut prev_lower_or_digit = false;

    for ch in input.chars() {
        if ch.is_alphanumeric() {
            if ch.is_uppercase() {
                if prev_lower_or_digit && !out.ends_with('_') {
                    out.push('_');
                }
                out.extend(ch.to_lowercase());
                prev_lower_or_digit = false;
            } else {
                out.push(ch);
                prev_lower_or_digit = true;
            }
        } else {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower_or_digit = false;
        }
    }

    out.trim_matches('_').to_string()
}

/// Title-Case a snake_case key: `"diagnosis_codes"` -> `"Diagnosis Codes"`.
pub fn title_case(key: &str) -> String {
    key.split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
