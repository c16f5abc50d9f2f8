//! Command injection screening
//!
//! Stdio servers are launched from configuration, which may come from
//! untrusted project files. Commands and arguments carrying shell
//! metacharacters are refused before anything is spawned.

use crate::error::{TransportError, TransportResult};
use once_cell::sync::Lazy;
use regex::Regex;

/// One forbidden construct
struct InjectionPattern {
    regex: Regex,
    literal: &'static str,
    description: &'static str,
}

/// Pattern set checked in order; first match wins
struct PatternSet {
    patterns: Vec<InjectionPattern>,
}

impl PatternSet {
    fn new(patterns: Vec<(&str, &'static str, &'static str)>) -> Self {
        let patterns = patterns
            .into_iter()
            .map(|(pattern, literal, description)| InjectionPattern {
                regex: Regex::new(pattern).expect("invalid injection pattern"),
                literal,
                description,
            })
            .collect();
        Self { patterns }
    }

    fn check(&self, text: &str) -> Option<&InjectionPattern> {
        self.patterns.iter().find(|p| p.regex.is_match(text))
    }
}

static INJECTION_PATTERNS: Lazy<PatternSet> = Lazy::new(|| {
    PatternSet::new(vec![
        (r";", ";", "a command separator"),
        (r"&&", "&&", "a command chain"),
        (r"\|", "|", "a pipe"),
        (r"`", "`", "a backtick substitution"),
        (r"\$\(", "$(", "a command substitution"),
        (r"[\r\n]", "\\n", "a line break"),
    ])
});

/// Reject a command line carrying shell injection constructs
///
/// Checks the command first, then every argument; the error names the
/// first offending position.
pub fn validate_command(command: &str, args: &[String]) -> TransportResult<()> {
    if let Some(pattern) = INJECTION_PATTERNS.check(command) {
        return Err(rejection("command".to_string(), pattern));
    }

    for (index, arg) in args.iter().enumerate() {
        if let Some(pattern) = INJECTION_PATTERNS.check(arg) {
            return Err(rejection(format!("argument {}", index + 1), pattern));
        }
    }

    Ok(())
}

fn rejection(location: String, pattern: &InjectionPattern) -> TransportError {
    tracing::warn!(
        location = %location,
        pattern = pattern.literal,
        "Rejected stdio command: {}",
        pattern.description
    );
    TransportError::UnsafeCommand {
        location,
        description: pattern.description.to_string(),
        pattern: pattern.literal.to_string(),
    }
}
