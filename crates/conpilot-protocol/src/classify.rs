//! Console state classification for session reset.
//!
//! Resetting a console means: send an interrupt, look at what came back,
//! react. This module owns the "look" part. A [`ResetProfile`] bundles the
//! interrupt bytes and the patterns that recognise each state for one
//! device family.

use std::fmt;

use conpilot_core::DeviceFamily;
use regex::Regex;

/// Ctrl-C
pub const INTERRUPT: u8 = 0x03;

/// What the console is currently showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsoleState {
    /// An interactive prompt, ready for commands.
    Prompt,
    /// A login prompt asking for a user name.
    LoginPrompt,
    /// A password prompt.
    PasswordPrompt,
    /// A continuation prompt (unterminated quote or here-doc).
    Continuation,
    /// Nothing recognisable.
    Unknown,
}

impl fmt::Display for ConsoleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prompt => "prompt",
            Self::LoginPrompt => "login prompt",
            Self::PasswordPrompt => "password prompt",
            Self::Continuation => "continuation prompt",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Interrupt bytes and state patterns for one device family.
#[derive(Debug, Clone)]
pub struct ResetProfile {
    family: DeviceFamily,
    interrupt: Vec<u8>,
    prompt: Vec<Regex>,
    login: Vec<Regex>,
    password: Vec<Regex>,
    continuation: Vec<Regex>,
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

impl ResetProfile {
    /// Builds the profile for `family`, adding `extra_prompts` as literal
    /// prompt strings.
    pub fn for_family(family: DeviceFamily, extra_prompts: &[String]) -> Self {
        let mut profile = match family {
            DeviceFamily::Shell => Self {
                family,
                interrupt: vec![INTERRUPT, b'\n'],
                prompt: compile(&[r"[#$]\s*$"]),
                login: compile(&[r"(?i)login:\s*$"]),
                password: compile(&[r"(?i)password:\s*$"]),
                continuation: compile(&[r"^\s*>\s*$", r"^(?:d?quote|heredoc|cmdand|pipe)>\s*$"]),
            },
            DeviceFamily::Bootloader => Self {
                family,
                interrupt: vec![INTERRUPT, b'\n'],
                prompt: compile(&[r"(?:=>|U-Boot>)\s*$"]),
                login: Vec::new(),
                password: compile(&[r"(?i)password:\s*$"]),
                continuation: Vec::new(),
            },
        };

        profile.prompt.extend(
            extra_prompts
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .filter_map(|p| Regex::new(&format!(r"{}\s*$", regex::escape(p))).ok()),
        );
        profile
    }

    pub fn family(&self) -> DeviceFamily {
        self.family
    }

    /// Bytes that abort whatever the console is doing.
    pub fn interrupt(&self) -> &[u8] {
        &self.interrupt
    }

    /// Classifies a single line.
    pub fn classify_line(&self, line: &str) -> ConsoleState {
        let matches = |set: &[Regex]| set.iter().any(|re| re.is_match(line));

        // Password before login: "Login password:" must not look like a login prompt
        if matches(&self.password) {
            ConsoleState::PasswordPrompt
        } else if matches(&self.login) {
            ConsoleState::LoginPrompt
        } else if matches(&self.continuation) {
            ConsoleState::Continuation
        } else if matches(&self.prompt) {
            ConsoleState::Prompt
        } else {
            ConsoleState::Unknown
        }
    }

    /// Classifies the console by the last non-blank line of a response.
    pub fn classify<S: AsRef<str>>(&self, lines: &[S]) -> ConsoleState {
        lines
            .iter()
            .map(AsRef::as_ref)
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(|line| self.classify_line(line))
            .unwrap_or(ConsoleState::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> ResetProfile {
        ResetProfile::for_family(DeviceFamily::Shell, &[])
    }

    #[test]
    fn test_shell_prompts() {
        let profile = shell();
        assert_eq!(profile.classify_line("root@dut:~# "), ConsoleState::Prompt);
        assert_eq!(profile.classify_line("user@host:/tmp$"), ConsoleState::Prompt);
        assert_eq!(profile.classify_line("dut login: "), ConsoleState::LoginPrompt);
        assert_eq!(profile.classify_line("Password: "), ConsoleState::PasswordPrompt);
        assert_eq!(profile.classify_line("> "), ConsoleState::Continuation);
        assert_eq!(profile.classify_line("dquote> "), ConsoleState::Continuation);
        assert_eq!(profile.classify_line("Starting kernel ..."), ConsoleState::Unknown);
    }

    #[test]
    fn test_classify_uses_last_non_blank_line() {
        let profile = shell();
        let lines = ["^C", "root@dut:~# ", "", "  "];
        assert_eq!(profile.classify(&lines), ConsoleState::Prompt);

        let lines = ["root@dut:~# exit", "dut login: "];
        assert_eq!(profile.classify(&lines), ConsoleState::LoginPrompt);
    }

    #[test]
    fn test_classify_empty_is_unknown() {
        let empty: [&str; 0] = [];
        assert_eq!(shell().classify(&empty), ConsoleState::Unknown);
    }

    #[test]
    fn test_bootloader_profile() {
        let profile = ResetProfile::for_family(DeviceFamily::Bootloader, &[]);
        assert_eq!(profile.classify_line("=> "), ConsoleState::Prompt);
        assert_eq!(profile.classify_line("U-Boot> "), ConsoleState::Prompt);
        assert_eq!(profile.classify_line("dut login: "), ConsoleState::Unknown);
        assert_eq!(profile.interrupt(), &[INTERRUPT, b'\n']);
    }

    #[test]
    fn test_extra_prompts_are_literal() {
        let profile =
            ResetProfile::for_family(DeviceFamily::Bootloader, &["ctrl[0]>".to_string()]);
        assert_eq!(profile.classify_line("ctrl[0]> "), ConsoleState::Prompt);
        assert_eq!(profile.classify_line("ctrl0>"), ConsoleState::Unknown);
    }
}
