use crate::error::{BuildError, Result};
use crate::pattern::{self, IgnorePattern, IgnorePatterns};

/// Name of the ignore file looked up at the context root.
pub static IGNORE_FILE: &str = ".dockerignore";

/// Parses ignore-file text into an ordered rule set.
///
/// Blank lines and `#` comments are skipped. A leading `!` negates. A line
/// that is only `!` is an illegal exclusion and fails context preparation.
pub fn parse(text: &str) -> Result<IgnorePatterns> {
    let mut rules = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "!" {
            return Err(BuildError::Context(
                "illegal exclusion pattern: \"!\"".into(),
            ));
        }
        let (negated, body) = match line.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, line),
        };
        let cleaned = pattern::clean(body.trim_start_matches('/'));
        if cleaned == "." {
            continue;
        }
        rules.push(IgnorePattern {
            pattern: cleaned,
            negated,
        });
    }
    Ok(IgnorePatterns::new(rules))
}
