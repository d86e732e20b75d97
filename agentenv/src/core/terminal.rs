//! Startup planning for interactive terminals.
//!
//! The snapshot's `/etc/shells` is probed for bash; when present the session
//! starts bash with a generated rc file that sources the user's `~/.bashrc`.
//! Otherwise a POSIX `sh` is started with the rc file passed through `ENV`.

/// Path of the generated startup script inside the snapshot.
pub const RC_PATH: &str = "/.agentenv/rc.sh";

const PROMPT: &str =
    r#"export PS1="\033[33magentenv\033[0m \033[02m\$(pwd | sed \"s|^\$HOME|~|\")\033[0m \$ ""#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalPlan {
    /// Command that starts the interactive session.
    pub command: Vec<String>,
    /// Contents of the startup script written to [`RC_PATH`].
    pub rc_script: String,
    /// When true the script is hooked in through the `ENV` variable.
    pub env_hook: bool,
}

pub fn plan_terminal(shells: Option<&str>) -> TerminalPlan {
    let bash = shells.and_then(|list| {
        list.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .find(|line| line.ends_with("/bash"))
    });

    match bash {
        Some(shell) => TerminalPlan {
            command: vec![
                shell.to_string(),
                "--rcfile".to_string(),
                RC_PATH.to_string(),
                "-i".to_string(),
            ],
            rc_script: format!(
                "[ -f ~/.bashrc ] && . ~/.bashrc; {shell:?} --version | head -4; {PROMPT}\n"
            ),
            env_hook: false,
        },
        None => TerminalPlan {
            command: vec!["sh".to_string()],
            rc_script: format!("{PROMPT}\n"),
            env_hook: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_bash_from_shells_list() {
        let shells = "# /etc/shells: valid login shells\n/bin/sh\n/usr/bin/bash\n";
        let plan = plan_terminal(Some(shells));
        assert_eq!(plan.command[0], "/usr/bin/bash");
        assert_eq!(plan.command[2], RC_PATH);
        assert!(plan.rc_script.contains("~/.bashrc"));
        assert!(!plan.env_hook);
    }

    #[test]
    fn falls_back_to_posix_sh_with_env_hook() {
        let plan = plan_terminal(Some("/bin/sh\n/bin/ash\n"));
        assert_eq!(plan.command, vec!["sh".to_string()]);
        assert!(plan.env_hook);
        assert!(plan.rc_script.contains("PS1"));

        assert!(plan_terminal(None).env_hook);
    }
}
