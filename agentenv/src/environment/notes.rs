//! Append-only audit log of environment actions.
//!
//! Every command and file mutation appends exactly one entry. The history
//! layer periodically takes the rendered text with [`Notes::pop`] and stores
//! it alongside the worktree's commits.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoteKind {
    Command {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Message {
        text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteEntry {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: NoteKind,
}

impl NoteEntry {
    pub fn render(&self) -> String {
        match &self.kind {
            NoteKind::Command {
                command,
                exit_code,
                stdout,
                stderr,
            } => {
                let mut out = format!("$ {}\nexit {exit_code}\n", command.trim());
                for stream in [stdout, stderr] {
                    if !stream.is_empty() {
                        out.push_str(stream);
                        if !stream.ends_with('\n') {
                            out.push('\n');
                        }
                    }
                }
                out
            }
            NoteKind::Message { text } => format!("{text}\n"),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match &self.kind {
            NoteKind::Command { exit_code, .. } => Some(*exit_code),
            NoteKind::Message { .. } => None,
        }
    }
}

/// Thread-safe, ordered log shared between an environment and its history layer.
#[derive(Debug, Default)]
pub struct Notes {
    entries: Mutex<Vec<NoteEntry>>,
}

impl Notes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_command(&self, command: &str, exit_code: i32, stdout: &str, stderr: &str) {
        self.push(NoteKind::Command {
            command: command.to_string(),
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }

    pub fn add(&self, text: impl Into<String>) {
        self.push(NoteKind::Message { text: text.into() });
    }

    fn push(&self, kind: NoteKind) {
        self.entries.lock().push(NoteEntry {
            at: Utc::now(),
            kind,
        });
    }

    pub fn entries(&self) -> Vec<NoteEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Rendered text of every pending entry; the log is emptied.
    pub fn pop(&self) -> String {
        let drained: Vec<NoteEntry> = std::mem::take(&mut *self.entries.lock());
        drained.iter().map(NoteEntry::render).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_renders_prompt_exit_and_output() {
        let notes = Notes::new();
        notes.add_command("echo hi", 0, "hi\n", "");
        notes.add_command("false", 1, "", "boom");
        notes.add("Write src/lib.rs");

        assert_eq!(notes.len(), 3);
        assert_eq!(
            notes.pop(),
            "$ echo hi\nexit 0\nhi\n$ false\nexit 1\nboom\nWrite src/lib.rs\n"
        );
        assert!(notes.is_empty());
    }

    #[test]
    fn entries_serialize_with_kind_tag() {
        let notes = Notes::new();
        notes.add("Delete a.txt");
        let json = serde_json::to_value(&notes.entries()[0]).expect("json");
        assert_eq!(json["kind"], "message");
        assert_eq!(json["text"], "Delete a.txt");
    }
}
