//! Command policy: block-list, allow-list and mirror-affecting patterns
//!
//! Patterns are matched on whole tokens, case-insensitively. A block-list
//! pattern is checked against the whole command and against every command the
//! device shell could end up running: each segment of a chained line (`;`,
//! `&`, `&&`, `|`, `||`), each `$(...)` or backtick body, and whatever a
//! leading `shell`, `sh -c`, `su` or similar wrapper hands on. So
//! `shell ls; rm -rf /` and `shell sh -c 'rm -rf /'` are both caught by `rm -rf`.

use std::sync::LazyLock;

use regex::Regex;

use fleet_core::RejectReason;

use crate::config::SecuritySettings;

/// Separators that start a new command inside a device shell line, including
/// the boundaries of command substitutions and subshells
static SEGMENT_SPLIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\|\||&&|\$\(|[;|&\n()`]").expect("Invalid segment regex")
});

/// Leading adb subcommands whose remainder runs in the device shell
const SHELL_VERBS: [&str; 2] = ["shell", "exec-out"];

/// Commands that run their arguments as another command
const WRAPPERS: [&str; 8] = [
    "exec", "nohup", "busybox", "toybox", "env", "time", "nice", "command",
];

/// Shells whose `-c` argument is a command line
const INTERPRETERS: [&str; 6] = ["sh", "bash", "ash", "mksh", "zsh", "su"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandPolicy {
    allowed: Vec<String>,
    blocked: Vec<Vec<String>>,
    mirror_affecting: Vec<Vec<String>>,
}

impl CommandPolicy {
    pub fn new<S: AsRef<str>>(allowed: &[S], blocked: &[S], mirror_affecting: &[S]) -> Self {
        Self {
            allowed: allowed
                .iter()
                .map(|a| a.as_ref().trim().to_ascii_lowercase())
                .filter(|a| !a.is_empty())
                .collect(),
            blocked: patterns(blocked),
            mirror_affecting: patterns(mirror_affecting),
        }
    }

    pub fn from_settings(settings: &SecuritySettings) -> Self {
        Self::new(
            &settings.allowed_commands,
            &settings.blocked_commands,
            &settings.mirror_affecting,
        )
    }

    /// Block-list first, then allow-list. An empty allow-list allows everything.
    pub fn check(&self, command: &str) -> Result<(), RejectReason> {
        if tokens(command).is_empty() {
            return Err(RejectReason::EmptyCommand);
        }
        if self.is_blocked(command) {
            return Err(RejectReason::Blocked);
        }
        if !self.is_allowed(command) {
            return Err(RejectReason::NotAllowed);
        }
        Ok(())
    }

    pub fn is_blocked(&self, command: &str) -> bool {
        matches_any(&self.blocked, command)
    }

    /// Leading token must be an allowed operation
    pub fn is_allowed(&self, command: &str) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        match tokens(command).first() {
            Some(leading) => self.allowed.iter().any(|a| a == leading),
            None => false,
        }
    }

    /// Whether the command must be serialized against mirror start/stop
    pub fn affects_mirror(&self, command: &str) -> bool {
        matches_any(&self.mirror_affecting, command)
    }
}

fn patterns<S: AsRef<str>>(entries: &[S]) -> Vec<Vec<String>> {
    entries
        .iter()
        .map(|e| tokens(e.as_ref()))
        .filter(|p| !p.is_empty())
        .collect()
}

/// Lowercased whitespace tokens with surrounding quotes and escapes removed
fn tokens(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| {
            t.trim_matches(|c| c == '\'' || c == '"' || c == '\\')
                .to_ascii_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// Every token sequence a pattern is tried against
fn candidates(command: &str) -> Vec<Vec<String>> {
    let mut out = vec![tokens(command)];

    for segment in SEGMENT_SPLIT.split(command) {
        let mut toks = tokens(segment);
        while !toks.is_empty() {
            let skip = wrapper_len(&toks);
            out.push(toks.clone());
            if skip == 0 {
                break;
            }
            toks.drain(..skip);
        }
    }

    out
}

/// How many leading tokens only hand the rest of the line to another command
fn wrapper_len(toks: &[String]) -> usize {
    let head = toks[0].as_str();
    if SHELL_VERBS.contains(&head) || WRAPPERS.contains(&head) {
        return 1;
    }
    if !INTERPRETERS.contains(&head) {
        return 0;
    }
    if let Some(pos) = toks.iter().position(|t| t == "-c") {
        return pos + 1;
    }
    // `su 0 <command>` / `su root <command>`
    let names_user = |user: &String| user == "root" || user.chars().all(|c| c.is_ascii_digit());
    if head == "su" && toks.get(1).is_some_and(names_user) {
        2
    } else {
        1
    }
}

fn starts_with(tokens: &[String], pattern: &[String]) -> bool {
    tokens.len() >= pattern.len() && tokens.iter().zip(pattern).all(|(t, p)| t == p)
}

fn matches_any(patterns: &[Vec<String>], command: &str) -> bool {
    if patterns.is_empty() {
        return false;
    }
    candidates(command)
        .iter()
        .any(|toks| patterns.iter().any(|p| starts_with(toks, p)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_policy() -> CommandPolicy {
        CommandPolicy::from_settings(&SecuritySettings::default())
    }

    #[test]
    fn test_blocked_commands() {
        let policy = default_policy();
        assert_eq!(policy.check("rm -rf /"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("shell rm -rf /sdcard"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("shell RM -RF /data"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("fastboot flash boot boot.img"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("shell dd if=/dev/zero of=/dev/block/sda"), Err(RejectReason::Blocked));
    }

    #[test]
    fn test_chained_segments_are_checked() {
        let policy = default_policy();
        assert_eq!(policy.check("shell ls; rm -rf /"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("shell ls && format /data"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("shell cat x | dd of=/dev/null"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("shell true || 'rm' -rf /"), Err(RejectReason::Blocked));
    }

    #[test]
    fn test_single_ampersand_is_a_separator() {
        let policy = default_policy();
        assert_eq!(policy.check("shell ls & rm -rf /"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("shell sleep 1&dd if=/dev/zero"), Err(RejectReason::Blocked));
    }

    #[test]
    fn test_command_substitution_is_checked() {
        let policy = default_policy();
        assert_eq!(policy.check("shell $(rm -rf /)"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("shell `rm -rf /`"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("shell echo $(echo `rm -rf /sdcard`)"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("shell (rm -rf /data)"), Err(RejectReason::Blocked));
    }

    #[test]
    fn test_interpreter_arguments_are_checked() {
        let policy = default_policy();
        assert_eq!(policy.check("shell sh -c 'rm -rf /'"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("shell bash -c \"ls; rm -rf /\""), Err(RejectReason::Blocked));
        assert_eq!(policy.check("shell su -c 'dd if=/dev/zero of=/dev/block/sda'"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("shell su 0 rm -rf /data"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("shell busybox rm -rf /"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("shell \\rm -rf /"), Err(RejectReason::Blocked));
    }

    #[test]
    fn test_matching_is_token_aligned() {
        let policy = default_policy();
        assert_eq!(policy.check("shell add-service"), Ok(()));
        assert_eq!(policy.check("shell formatter --help"), Ok(()));
        assert_eq!(policy.check("shell rm file.txt"), Ok(()));
    }

    #[test]
    fn test_allow_list_checks_leading_token() {
        let policy = default_policy();
        assert_eq!(policy.check("shell getprop"), Ok(()));
        assert_eq!(policy.check("install app.apk"), Ok(()));
        assert_eq!(policy.check("reboot"), Err(RejectReason::NotAllowed));
        assert_eq!(policy.check("sideload ota.zip"), Err(RejectReason::NotAllowed));
    }

    #[test]
    fn test_empty_allow_list_allows_all_but_blocked() {
        let policy = CommandPolicy::new(&[] as &[&str], &["rm -rf"], &[]);
        assert_eq!(policy.check("reboot"), Ok(()));
        assert_eq!(policy.check("rm -rf /"), Err(RejectReason::Blocked));
    }

    #[test]
    fn test_block_list_wins_over_allow_list() {
        let policy = CommandPolicy::new(&["rm"], &["rm -rf"], &[]);
        assert_eq!(policy.check("rm -rf /"), Err(RejectReason::Blocked));
        assert_eq!(policy.check("rm notes.txt"), Ok(()));
    }

    #[test]
    fn test_empty_command() {
        assert_eq!(default_policy().check("   "), Err(RejectReason::EmptyCommand));
    }

    #[test]
    fn test_mirror_affecting() {
        let policy = default_policy();
        assert!(policy.affects_mirror("reboot"));
        assert!(policy.affects_mirror("shell wm size 1080x1920"));
        assert!(policy.affects_mirror("shell reboot"));
        assert!(!policy.affects_mirror("shell getprop"));
    }
}
