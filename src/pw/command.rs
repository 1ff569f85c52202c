use serde::Serialize;
use std::path::{Path, PathBuf};

/// A program command as declared in configuration: either a single shell
/// line or an explicit argv list.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CommandLine {
    Line(String),
    Argv(Vec<String>),
}

impl CommandLine {
    /// Split into argv. The line form uses POSIX shell-word splitting
    /// (backticks are never interpreted); the argv form is taken as-is.
    /// Every element then gets `$VAR`/`${VAR}` expansion and leading-`~`
    /// expansion.
    pub fn to_argv(&self) -> anyhow::Result<Vec<String>> {
        let words = match self {
            CommandLine::Line(s) => shell_words::split(s)
                .map_err(|e| anyhow::anyhow!("invalid command {s:?}: {e}"))?,
            CommandLine::Argv(v) => v.clone(),
        };
        anyhow::ensure!(!words.is_empty(), "command is empty");
        Ok(words.iter().map(|w| expand_word(w)).collect())
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandLine::Line(s) => f.write_str(s),
            CommandLine::Argv(v) => f.write_str(&shell_words::join(v)),
        }
    }
}

pub(crate) fn expand_word(word: &str) -> String {
    expand_vars(&expand_tilde(word))
}

/// Expand a configured path the same way argv elements are expanded.
pub(crate) fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_word(&path.to_string_lossy()))
}

fn expand_tilde(word: &str) -> String {
    if let Some(rest) = word.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') {
            if let Ok(home) = std::env::var("HOME") {
                return format!("{home}{rest}");
            }
        }
    }
    word.to_string()
}

/// `$NAME` and `${NAME}` from the process environment. Unset variables
/// expand to the empty string, matching shell behavior. A `$` that does not
/// introduce a variable name is kept literally.
fn expand_vars(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut chars = word.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c2) in chars.by_ref() {
                    if c2 == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c2);
                }
                if closed && is_valid_var_name(&name) {
                    out.push_str(&std::env::var(&name).unwrap_or_default());
                } else {
                    out.push_str("${");
                    out.push_str(&name);
                    if closed {
                        out.push('}');
                    }
                }
            }
            Some((_, c2)) if c2.is_ascii_alphabetic() || *c2 == '_' => {
                let mut name = String::new();
                while let Some((_, c2)) = chars.peek() {
                    if c2.is_ascii_alphanumeric() || *c2 == '_' {
                        name.push(*c2);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }
    out
}

fn is_valid_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_shell_words() {
        let cmd = CommandLine::Line("/bin/echo 'hello world' two".to_string());
        let argv = cmd.to_argv().unwrap();
        assert_eq!(argv, vec!["/bin/echo", "hello world", "two"]);
    }

    #[test]
    fn argv_form_passes_through() {
        let cmd = CommandLine::Argv(vec!["/bin/echo".into(), "a b".into()]);
        assert_eq!(cmd.to_argv().unwrap(), vec!["/bin/echo", "a b"]);
    }

    #[test]
    fn empty_command_is_an_error() {
        assert!(CommandLine::Line("   ".to_string()).to_argv().is_err());
        assert!(CommandLine::Argv(vec![]).to_argv().is_err());
    }

    #[test]
    fn unbalanced_quote_is_an_error() {
        assert!(CommandLine::Line("/bin/echo 'oops".to_string()).to_argv().is_err());
    }

    #[test]
    fn expands_environment_variables() {
        std::env::set_var("PROCWATCH_TEST_VAR", "abc");
        let cmd = CommandLine::Line("run $PROCWATCH_TEST_VAR ${PROCWATCH_TEST_VAR}/x".to_string());
        assert_eq!(cmd.to_argv().unwrap(), vec!["run", "abc", "abc/x"]);
    }

    #[test]
    fn unset_variable_expands_to_empty() {
        std::env::remove_var("PROCWATCH_TEST_UNSET");
        assert_eq!(expand_vars("a$PROCWATCH_TEST_UNSET-b"), "a-b");
    }

    #[test]
    fn lone_dollar_is_literal() {
        assert_eq!(expand_vars("a$ b$"), "a$ b$");
        assert_eq!(expand_vars("cost$5"), "cost$5");
    }

    #[test]
    fn expands_leading_tilde() {
        std::env::set_var("HOME", "/home/someone");
        assert_eq!(expand_tilde("~/bin/tool"), "/home/someone/bin/tool");
        assert_eq!(expand_tilde("a~b"), "a~b");
    }
}
