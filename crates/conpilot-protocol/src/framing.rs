//! Sentinel framing for shell commands over an unframed console stream.
//!
//! The console has no message boundaries, and neither the echoed command
//! nor the prompt is a trustworthy completion marker. Every command is
//! therefore sent as
//!
//! ```text
//! <command>[; EXITCODE=$?]; PRE=<head> && echo "$PRE"<tail>
//! ```
//!
//! The shell prints `<head><tail>` (the sentinel) once the command is done.
//! The echoed command line only ever contains `<head>` and `<tail>` apart,
//! so waiting for the joined sentinel cannot match the echo. The tail
//! carries a per-command nonce, which keeps a late sentinel from an earlier
//! command from completing a newer one.

/// First half of every sentinel.
const SENTINEL_HEAD: &str = "__CONPILOT";

/// Second half prefix; the nonce and a closing `__` follow.
const SENTINEL_TAIL: &str = "_DONE_";

/// One framed command, ready to be written to the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    command: String,
    nonce: u64,
    capture_exit_code: bool,
}

impl CommandFrame {
    /// Frames `command` using the given nonce.
    ///
    /// Trailing whitespace and `;` are removed so the appended framing
    /// stays valid shell.
    pub fn new(command: &str, nonce: u64) -> Self {
        let command = command
            .trim_end()
            .trim_end_matches(';')
            .trim_end()
            .to_string();
        Self {
            command,
            nonce,
            capture_exit_code: false,
        }
    }

    /// Also store the command's exit status in `$EXITCODE`.
    #[must_use]
    pub fn with_exit_code(mut self) -> Self {
        self.capture_exit_code = true;
        self
    }

    /// Frame that prints the exit status stored by a previous frame.
    pub fn exit_code_query(nonce: u64) -> Self {
        Self::new("echo $EXITCODE", nonce)
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    fn tail(&self) -> String {
        format!("{SENTINEL_TAIL}{}__", self.nonce)
    }

    /// The marker printed by the shell once the command has finished.
    pub fn sentinel(&self) -> String {
        format!("{SENTINEL_HEAD}{}", self.tail())
    }

    /// Text unique to the echoed command line.
    fn echo_marker(&self) -> String {
        format!("\"$PRE\"{}", self.tail())
    }

    /// The full line to transmit, including the trailing newline.
    pub fn wire_text(&self) -> String {
        let mut text = String::with_capacity(self.command.len() + 64);
        if !self.command.is_empty() {
            text.push_str(&self.command);
            text.push_str("; ");
        }
        if self.capture_exit_code {
            text.push_str("EXITCODE=$?; ");
        }
        text.push_str("PRE=");
        text.push_str(SENTINEL_HEAD);
        text.push_str(" && echo ");
        text.push_str(&self.echo_marker());
        text.push('\n');
        text
    }

    /// Extracts the command's own output from a captured block.
    ///
    /// `block` is the newline-joined text of every line read up to and
    /// including the sentinel line. Output starts after the echoed command
    /// line (or at the start of the block when the echo is missing) and
    /// ends where the sentinel begins. Returns `None` if the sentinel is
    /// not in the block.
    pub fn extract_output(&self, block: &str) -> Option<String> {
        let echo_marker = self.echo_marker();
        let start = match block.rfind(&echo_marker) {
            Some(pos) => {
                let after_echo = pos + echo_marker.len();
                match block[after_echo..].find('\n') {
                    Some(nl) => after_echo + nl + 1,
                    None => block.len(),
                }
            }
            None => 0,
        };

        let sentinel = self.sentinel();
        let end = start + block.get(start..)?.find(&sentinel)?;
        let output = block[start..end].trim_end_matches(['\r', '\n']);
        Some(output.to_string())
    }
}

/// Parses the output of an exit-code query.
pub fn parse_exit_code(output: &str) -> Option<i32> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_text_shape() {
        let frame = CommandFrame::new("uptime", 7);
        assert_eq!(
            frame.wire_text(),
            "uptime; PRE=__CONPILOT && echo \"$PRE\"_DONE_7__\n"
        );
    }

    #[test]
    fn test_wire_text_with_exit_code() {
        let frame = CommandFrame::new("false", 3).with_exit_code();
        assert_eq!(
            frame.wire_text(),
            "false; EXITCODE=$?; PRE=__CONPILOT && echo \"$PRE\"_DONE_3__\n"
        );
    }

    #[test]
    fn test_trailing_semicolons_removed() {
        let frame = CommandFrame::new("sync ;  ", 1);
        assert_eq!(frame.command(), "sync");
    }

    #[test]
    fn test_echo_never_contains_sentinel() {
        let frame = CommandFrame::new("echo HELLO", 42).with_exit_code();
        assert!(!frame.wire_text().contains(&frame.sentinel()));
    }

    #[test]
    fn test_sentinel_depends_on_nonce() {
        assert_ne!(
            CommandFrame::new("ls", 1).sentinel(),
            CommandFrame::new("ls", 2).sentinel()
        );
    }

    #[test]
    fn test_extract_output_between_echo_and_sentinel() {
        let frame = CommandFrame::new("echo HELLO", 9);
        let echo = frame.wire_text();
        let block = format!(
            "root@dut:~# {}HELLO\n{}",
            echo,
            frame.sentinel()
        );
        assert_eq!(frame.extract_output(&block).as_deref(), Some("HELLO"));
    }

    #[test]
    fn test_extract_output_multiline() {
        let frame = CommandFrame::new("ls", 2);
        let block = format!(
            "noise before\n# {}a.txt\nb.txt\n{}",
            frame.wire_text(),
            frame.sentinel()
        );
        assert_eq!(frame.extract_output(&block).as_deref(), Some("a.txt\nb.txt"));
    }

    #[test]
    fn test_extract_output_without_trailing_newline() {
        let frame = CommandFrame::new("printf abc", 5);
        let block = format!("{}abc{}", frame.wire_text(), frame.sentinel());
        assert_eq!(frame.extract_output(&block).as_deref(), Some("abc"));
    }

    #[test]
    fn test_extract_output_empty() {
        let frame = CommandFrame::new("true", 5);
        let block = format!("{}{}", frame.wire_text(), frame.sentinel());
        assert_eq!(frame.extract_output(&block).as_deref(), Some(""));
    }

    #[test]
    fn test_extract_output_without_echo() {
        let frame = CommandFrame::new("echo hi", 5);
        let block = format!("hi\n{}", frame.sentinel());
        assert_eq!(frame.extract_output(&block).as_deref(), Some("hi"));
    }

    #[test]
    fn test_extract_output_missing_sentinel() {
        let frame = CommandFrame::new("echo hi", 5);
        let block = frame.wire_text() + "hi\n";
        assert_eq!(frame.extract_output(&block), None);
    }

    #[test]
    fn test_stale_sentinel_does_not_match() {
        let old = CommandFrame::new("sleep 10", 1);
        let new = CommandFrame::new("echo hi", 2);
        let block = format!("{}\n{}hi\n", old.sentinel(), new.wire_text());
        assert_eq!(new.extract_output(&block), None);
    }

    #[test]
    fn test_parse_exit_code() {
        assert_eq!(parse_exit_code("0"), Some(0));
        assert_eq!(parse_exit_code("garbage\n127\n"), Some(127));
        assert_eq!(parse_exit_code(""), None);
        assert_eq!(parse_exit_code("not a number"), None);
    }
}
