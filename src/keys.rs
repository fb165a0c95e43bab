//! # Lookup Key Builder
//!
//! Canonicalizes natural-key fragments into fully qualified lookup row keys.
//!
//! Two writers racing for overlapping key sets must traverse them in the same
//! order, so the builder always yields a sorted set. The first contended key
//! is then the same for both sides and exactly one of them makes progress.

use std::collections::BTreeSet;

/// Separator between the scope prefix and the natural-key fragment.
pub const SCOPE_DELIMITER: char = '|';

/// Build the canonical, sorted set of lookup row keys for a set of
/// natural-key fragments within a scope. Empty fragments are dropped.
pub fn build_lookup_keys<I, S>(uniques: I, scope: &str) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    uniques
        .into_iter()
        .filter(|fragment| !fragment.as_ref().is_empty())
        .map(|fragment| build_lookup_key(fragment.as_ref(), scope))
        .collect()
}

/// Build a single lookup row key: `"{scope}|{fragment}"`.
pub fn build_lookup_key(fragment: &str, scope: &str) -> String {
    format!("{}{}{}", scope, SCOPE_DELIMITER, fragment)
}

/// The row-key prefix shared by every lookup key in a scope: `"{scope}|"`.
pub fn build_key_prefix(scope: &str) -> String {
    format!("{}{}", scope, SCOPE_DELIMITER)
}
