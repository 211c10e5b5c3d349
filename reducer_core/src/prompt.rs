use std::io::{self, BufRead, Write};
use tracing::warn;

/// Yes/no decisions the driver needs from whoever runs it.
pub trait Confirm {
    fn confirm(&mut self, question: &str) -> bool;
}

/// Interprets a reply. Empty means "use the default"; unknown replies are `None`.
pub fn parse_answer(reply: &str, default: bool) -> Option<bool> {
    match reply.trim().to_lowercase().as_str() {
        "" => Some(default),
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Reads answers line by line, defaulting to yes on an empty line.
///
/// An unrecognized reply or end of input counts as no.
pub struct LineConfirm<R: BufRead> {
    reader: R,
    default: bool,
}

impl<R: BufRead> LineConfirm<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            default: true,
        }
    }
}

impl LineConfirm<io::StdinLock<'static>> {
    pub fn stdin() -> Self {
        Self::new(io::stdin().lock())
    }
}

impl<R: BufRead> Confirm for LineConfirm<R> {
    fn confirm(&mut self, question: &str) -> bool {
        let hint = if self.default { "[Y/n]" } else { "[y/N]" };
        eprint!("{question} {hint} ");
        let _ = io::stderr().flush();

        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => false,
            Ok(_) => parse_answer(&line, self.default).unwrap_or_else(|| {
                warn!(reply = %line.trim(), "unrecognized answer, treating as no");
                false
            }),
            Err(e) => {
                warn!("failed to read answer: {e}");
                false
            }
        }
    }
}

/// Never asks; always gives the same answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedConfirm(pub bool);

impl Confirm for FixedConfirm {
    fn confirm(&mut self, _question: &str) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn answers_are_parsed_case_insensitively() {
        assert_eq!(parse_answer("Y\n", false), Some(true));
        assert_eq!(parse_answer("yes", false), Some(true));
        assert_eq!(parse_answer("NO", true), Some(false));
        assert_eq!(parse_answer("n", true), Some(false));
        assert_eq!(parse_answer("\n", true), Some(true));
        assert_eq!(parse_answer("", false), Some(false));
        assert_eq!(parse_answer("maybe", true), None);
    }

    #[test]
    fn line_confirm_reads_successive_lines() {
        let mut confirm = LineConfirm::new(Cursor::new("y\n\nno\nwhat\n"));
        assert!(confirm.confirm("Continue?"));
        assert!(confirm.confirm("Continue?"));
        assert!(!confirm.confirm("Continue?"));
        assert!(!confirm.confirm("Continue?"));
        // End of input.
        assert!(!confirm.confirm("Continue?"));
    }

    #[test]
    fn fixed_confirm_ignores_question() {
        assert!(FixedConfirm(true).confirm("anything"));
        assert!(!FixedConfirm(false).confirm("anything"));
    }
}
