//! Line-range slicing for partial file reads.

use crate::error::{EnvError, EnvResult};

/// Return lines `[start, end]` (1-indexed, inclusive) of `contents`.
///
/// Both bounds are clamped to the number of lines in the file. `start` below 1
/// or a resolved end before the resolved start is a [`EnvError::Range`].
pub fn select_lines(contents: &str, start: usize, end: usize) -> EnvResult<String> {
    if start < 1 {
        return Err(EnvError::Range(format!(
            "start line ({start}) cannot be less than 1"
        )));
    }
    let lines: Vec<&str> = contents.lines().collect();
    if lines.is_empty() {
        return Ok(String::new());
    }
    let start = start.min(lines.len());
    let end = end.min(lines.len());
    if end < start {
        return Err(EnvError::Range(format!(
            "end line ({end}) must not precede start line ({start})"
        )));
    }
    Ok(lines[start - 1..end].join("\n"))
}
