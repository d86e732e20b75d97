//! Search/replace resolution for file edits.
//!
//! Occurrences of the search text are found left to right without overlap.
//! When more than one exists, each gets a deterministic id derived from the
//! path, search text, replacement and occurrence index, so a caller can retry
//! naming exactly one of them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EnvError, EnvResult};

const CONTEXT_LINES: usize = 3;
const MATCH_ID_LEN: usize = 8;

/// One candidate occurrence reported by an ambiguous edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub id: String,
    /// Numbered lines around the occurrence, its own line marked with `>`.
    pub context: String,
}

/// Byte offsets of every non-overlapping occurrence of `search`.
pub fn find_matches(contents: &str, search: &str) -> Vec<usize> {
    if search.is_empty() {
        return Vec::new();
    }
    contents.match_indices(search).map(|(i, _)| i).collect()
}

pub fn match_id(path: &str, search: &str, replace: &str, index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{path}:{search}:{replace}:{index}").as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..MATCH_ID_LEN].to_string()
}

/// Render the lines around byte `offset`, 1-indexed and right-aligned.
pub fn match_context(contents: &str, offset: usize) -> String {
    let lines: Vec<&str> = contents.split('\n').collect();
    let match_line = contents[..offset].matches('\n').count();
    let start = match_line.saturating_sub(CONTEXT_LINES);
    let end = (match_line + CONTEXT_LINES + 1).min(lines.len());

    (start..end)
        .map(|i| {
            let marker = if i == match_line { '>' } else { ' ' };
            format!("{marker} {:4} | {}", i + 1, lines[i])
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Compute the edited contents, or explain why the edit cannot be resolved.
///
/// - zero occurrences: [`EnvError::NotFound`]
/// - one occurrence: replaced regardless of `which`
/// - several without `which`: [`EnvError::AmbiguousMatch`] listing every candidate
/// - several with `which`: the occurrence whose id equals `which`, else `NotFound`
pub fn resolve_edit(
    path: &str,
    contents: &str,
    search: &str,
    replace: &str,
    which: Option<&str>,
) -> EnvResult<String> {
    let matches = find_matches(contents, search);
    let target = match matches.as_slice() {
        [] => {
            return Err(EnvError::NotFound(format!(
                "search text not found in file {path}"
            )));
        }
        [only] => *only,
        many => match which.filter(|id| !id.is_empty()) {
            None => {
                let candidates = many
                    .iter()
                    .enumerate()
                    .map(|(i, offset)| MatchCandidate {
                        id: match_id(path, search, replace, i),
                        context: match_context(contents, *offset),
                    })
                    .collect();
                return Err(EnvError::AmbiguousMatch {
                    path: path.to_string(),
                    matches: candidates,
                });
            }
            Some(wanted) => many
                .iter()
                .enumerate()
                .find(|(i, _)| match_id(path, search, replace, *i) == wanted)
                .map(|(_, offset)| *offset)
                .ok_or_else(|| {
                    EnvError::NotFound(format!("match id {wanted} not found in file {path}"))
                })?,
        },
    };

    let mut out = String::with_capacity(contents.len() + replace.len());
    out.push_str(&contents[..target]);
    out.push_str(replace);
    out.push_str(&contents[target + search.len()..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE: &str = "a\nfoo\nb\nfoo\nc\nfoo\n";

    fn ambiguous_ids(path: &str, contents: &str) -> Vec<String> {
        match resolve_edit(path, contents, "foo", "bar", None) {
            Err(EnvError::AmbiguousMatch { matches, .. }) => {
                matches.into_iter().map(|m| m.id).collect()
            }
            other => panic!("expected ambiguous match, got {other:?}"),
        }
    }

    #[test]
    fn single_match_is_replaced_without_id() {
        let out = resolve_edit("f", "x foo y", "foo", "bar", None).expect("edit");
        assert_eq!(out, "x bar y");
    }

    #[test]
    fn missing_search_is_not_found() {
        let err = resolve_edit("f", "abc", "zzz", "y", None).unwrap_err();
        assert!(matches!(err, EnvError::NotFound(_)));
    }

    #[test]
    fn three_matches_yield_three_stable_ids() {
        let first = ambiguous_ids("f.txt", THREE);
        let second = ambiguous_ids("f.txt", THREE);
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert_ne!(first[0], first[1]);
        assert_ne!(first[1], first[2]);
    }

    #[test]
    fn chosen_id_replaces_exactly_one_occurrence() {
        let ids = ambiguous_ids("f.txt", THREE);
        let out = resolve_edit("f.txt", THREE, "foo", "bar", Some(&ids[1])).expect("edit");
        assert_eq!(out, "a\nfoo\nb\nbar\nc\nfoo\n");
    }

    #[test]
    fn unknown_id_is_not_found() {
        let err = resolve_edit("f.txt", THREE, "foo", "bar", Some("deadbeef")).unwrap_err();
        assert!(matches!(err, EnvError::NotFound(_)));
    }

    #[test]
    fn occurrences_do_not_overlap() {
        assert_eq!(find_matches("aaaa", "aa"), vec![0, 2]);
    }

    #[test]
    fn context_marks_match_line_with_numbers() {
        let contents = "l1\nl2\nl3\nl4 foo\nl5\nl6\nl7\nl8";
        let offset = contents.find("foo").expect("offset");
        let ctx = match_context(contents, offset);
        let lines: Vec<&str> = ctx.lines().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], "     1 | l1");
        assert_eq!(lines[3], ">    4 | l4 foo");
        assert_eq!(lines[6], "     7 | l7");
    }
}
