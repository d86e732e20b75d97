//! Rendering of captured command output.

/// Stdout followed, when stderr is non-empty, by a `stderr:` section.
pub fn combine_output(stdout: &str, stderr: &str) -> String {
    if stderr.is_empty() {
        return stdout.to_string();
    }
    if stdout.is_empty() {
        return format!("stderr: {stderr}");
    }
    format!("{stdout}\nstderr: {stderr}")
}
