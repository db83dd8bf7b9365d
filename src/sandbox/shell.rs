//! Shell detection and in-sandbox command construction.
//!
//! The sandboxed program is always launched through the user's shell so
//! mise-managed toolchains activate and interactive sessions get a prompt
//! that makes the sandbox unmistakable.

use std::path::PathBuf;

/// Supported shell families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// fish
    Fish,
    /// zsh
    Zsh,
    /// bash (also the fallback for unknown shells)
    Bash,
}

impl Shell {
    /// Shell name as used in `mise activate <shell>`.
    pub fn name(self) -> &'static str {
        match self {
            Shell::Fish => "fish",
            Shell::Zsh => "zsh",
            Shell::Bash => "bash",
        }
    }
}

/// Detect the user's shell from `$SHELL`, falling back to bash.
pub fn detect_shell() -> (Shell, PathBuf) {
    let shell_env = std::env::var("SHELL").unwrap_or_default();
    let name = std::path::Path::new(&shell_env)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if name.contains("fish") {
        (Shell::Fish, PathBuf::from(shell_env))
    } else if name.contains("zsh") {
        (Shell::Zsh, PathBuf::from(shell_env))
    } else if name.contains("bash") {
        (Shell::Bash, PathBuf::from(shell_env))
    } else {
        (Shell::Bash, PathBuf::from("/bin/bash"))
    }
}

/// Build the argv executed inside the sandbox.
///
/// Interactive sessions (`args` empty) exec a fresh shell with a lock
/// prompt; one-shot commands run `shell -c "<mise-activation>; <command>"`.
/// Adapter-provided init snippets run before the command either way.
pub fn build_shell_command(
    shell: Shell,
    shell_path: &std::path::Path,
    project_name: &str,
    init_snippets: &[String],
    args: &[String],
) -> Vec<String> {
    let mut init: Vec<String> = vec![mise_activation(shell).to_string()];
    init.extend(init_snippets.iter().cloned());

    let shell_path = shell_path.to_string_lossy().into_owned();

    if args.is_empty() {
        let launch = match shell {
            Shell::Fish => format!(
                r#"set -gx fish_greeting "🔒 Sandbox: {project_name} | .env blocked | No SSH/git push"; exec fish"#
            ),
            Shell::Zsh => {
                format!(r#"PROMPT="🔒 [{project_name}] %~ $ "; exec zsh --no-rcs"#)
            }
            Shell::Bash => {
                format!(r#"PS1="🔒 [{project_name}] \w $ "; exec bash --norc --noprofile"#)
            }
        };
        init.push(launch);
    } else {
        init.push(args.join(" "));
    }

    vec![shell_path, "-c".to_string(), init.join("; ")]
}

fn mise_activation(shell: Shell) -> &'static str {
    match shell {
        Shell::Fish => "if command -q mise; mise activate fish | source; end",
        Shell::Zsh => r#"if command -v mise &>/dev/null; then eval "$(mise activate zsh)"; fi"#,
        Shell::Bash => r#"if command -v mise &>/dev/null; then eval "$(mise activate bash)"; fi"#,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn interactive_bash_has_prompt_marker() {
        let cmd = build_shell_command(Shell::Bash, Path::new("/bin/bash"), "proj", &[], &[]);
        assert_eq!(cmd[0], "/bin/bash");
        assert_eq!(cmd[1], "-c");
        assert!(cmd[2].contains("🔒 [proj]"));
        assert!(cmd[2].contains("mise activate bash"));
        assert!(cmd[2].contains("exec bash --norc --noprofile"));
    }

    #[test]
    fn interactive_fish_sets_greeting() {
        let cmd = build_shell_command(
            Shell::Fish,
            Path::new("/usr/bin/fish"),
            "proj",
            &[],
            &[],
        );
        assert!(cmd[2].contains("fish_greeting"));
        assert!(cmd[2].contains("🔒 Sandbox: proj"));
        assert!(cmd[2].contains("exec fish"));
    }

    #[test]
    fn interactive_zsh_skips_rc_files() {
        let cmd = build_shell_command(Shell::Zsh, Path::new("/usr/bin/zsh"), "proj", &[], &[]);
        assert!(cmd[2].contains("exec zsh --no-rcs"));
        assert!(cmd[2].contains("🔒 [proj]"));
    }

    #[test]
    fn command_mode_runs_args_after_activation() {
        let cmd = build_shell_command(
            Shell::Bash,
            Path::new("/bin/bash"),
            "proj",
            &[],
            &["npm".to_string(), "test".to_string()],
        );
        assert!(cmd[2].ends_with("npm test"));
        assert!(cmd[2].contains("mise activate bash"));
        assert!(!cmd[2].contains("exec bash"));
    }

    #[test]
    fn init_snippets_run_before_command() {
        let cmd = build_shell_command(
            Shell::Bash,
            Path::new("/bin/bash"),
            "proj",
            &["export FOO=1".to_string()],
            &["env".to_string()],
        );
        let script = &cmd[2];
        let foo = script.find("export FOO=1").unwrap();
        let run = script.find("; env").unwrap();
        assert!(foo < run);
    }
}
