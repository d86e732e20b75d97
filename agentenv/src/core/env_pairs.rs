//! Parsing for `KEY=VALUE` environment and secret entries.

use crate::error::{EnvError, EnvResult};

/// Split one entry on its first `=`.
///
/// The key must be non-empty and free of whitespace; the value may be empty
/// and may itself contain `=`.
pub fn parse_pair(entry: &str) -> Option<(&str, &str)> {
    let (key, value) = entry.split_once('=')?;
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return None;
    }
    Some((key, value))
}

/// Parse every entry, failing on the first malformed one.
///
/// `kind` names the list in the error message (e.g. `env`, `secret`).
pub fn parse_pairs(entries: &[String], kind: &str) -> EnvResult<Vec<(String, String)>> {
    entries
        .iter()
        .map(|entry| {
            parse_pair(entry)
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| EnvError::Config(format!("invalid {kind} entry: {entry:?}")))
        })
        .collect()
}

/// Resolve `KEY=ENV_VAR_NAME` secret mappings through `lookup`.
///
/// A mapping whose variable is not set on the invoking host is rejected so a
/// build never runs with a silently missing secret.
pub fn resolve_secrets<F>(entries: &[String], lookup: F) -> EnvResult<Vec<(String, String)>>
where
    F: Fn(&str) -> Option<String>,
{
    parse_pairs(entries, "secret")?
        .into_iter()
        .map(|(key, var)| match lookup(&var) {
            Some(value) => Ok((key, value)),
            None => Err(EnvError::Config(format!(
                "secret {key} references unset host variable {var}"
            ))),
        })
        .collect()
}
