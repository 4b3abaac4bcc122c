//! Classic-name alias allocation.
//!
//! Agents without a requested alias get the next free classic name
//! (`alice`, `bob`, ...), then numbered variants (`alice-01` .. `zoe-99`).
//! A name prefix counts as used even when the stored alias carries a longer
//! suffix (`alice-build` uses up `alice`).

use std::collections::HashSet;

pub const CLASSIC_NAMES: [&str; 26] = [
    "alice", "bob", "charlie", "dave", "eve", "frank", "grace", "henry", "ivy", "jack", "kate",
    "leo", "mia", "noah", "olivia", "peter", "quinn", "rose", "sam", "tara", "uma", "victor",
    "wendy", "xavier", "yara", "zoe",
];

/// Extract the allocation prefix from an alias: the leading name, plus the
/// numeric suffix when the alias is of the form `name-NN[-...]`.
pub fn extract_name_prefix(alias: &str) -> String {
    let alias = alias.trim();
    if alias.is_empty() {
        return String::new();
    }
    let mut parts = alias.split('-');
    let head = parts.next().unwrap_or_default();
    if let Some(second) = parts.next() {
        if !second.is_empty() && second.chars().all(|c| c.is_ascii_digit()) {
            return format!("{}-{}", head, second).to_lowercase();
        }
    }
    head.to_lowercase()
}

/// All allocatable prefixes in preference order.
pub fn candidate_name_prefixes() -> impl Iterator<Item = String> {
    let bare = CLASSIC_NAMES.iter().map(|n| n.to_string());
    let numbered = (1..100)
        .flat_map(|num| CLASSIC_NAMES.iter().map(move |name| format!("{}-{:02}", name, num)));
    bare.chain(numbered)
}

pub fn used_name_prefixes<'a>(existing_aliases: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    existing_aliases
        .into_iter()
        .map(extract_name_prefix)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Suggest the next free prefix, or `None` when the namespace is exhausted.
pub fn suggest_next_name_prefix<'a>(
    existing_aliases: impl IntoIterator<Item = &'a str>,
) -> Option<String> {
    let used = used_name_prefixes(existing_aliases);
    candidate_name_prefixes().find(|candidate| !used.contains(candidate))
}
