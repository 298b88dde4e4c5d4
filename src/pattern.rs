use crate::error::{BuildError, Result};

/// Cleans a slash-separated relative path: collapses duplicate separators,
/// drops `.` components and resolves `..` lexically. `./foo` and `foo`
/// clean to the same string.
pub fn clean(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if matches!(out.last(), Some(&"..")) || out.is_empty() {
                    out.push("..");
                } else {
                    out.pop();
                }
            }
            other => out.push(other),
        }
    }
    if out.is_empty() {
        ".".to_string()
    } else {
        out.join("/")
    }
}

/// Matches one path component against one pattern component.
/// Supports `*`, `?`, `[...]` classes (with `^`/`!` negation and ranges)
/// and `\` escaping.
fn match_component(pat: &[char], name: &[char]) -> Result<bool> {
    if pat.is_empty() {
        return Ok(name.is_empty());
    }
    match pat[0] {
        '*' => {
            for skip in 0..=name.len() {
                if match_component(&pat[1..], &name[skip..])? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        '?' => {
            if name.is_empty() {
                Ok(false)
            } else {
                match_component(&pat[1..], &name[1..])
            }
        }
        '\\' => {
            if pat.len() < 2 {
                return Err(BuildError::Pattern(pat.iter().collect()));
            }
            if name.is_empty() || name[0] != pat[1] {
                Ok(false)
            } else {
                match_component(&pat[2..], &name[1..])
            }
        }
        '[' => {
            let (matched, rest) = match_class(&pat[1..], name.first().copied())?;
            if name.is_empty() || !matched {
                Ok(false)
            } else {
                match_component(rest, &name[1..])
            }
        }
        c => {
            if name.is_empty() || name[0] != c {
                Ok(false)
            } else {
                match_component(&pat[1..], &name[1..])
            }
        }
    }
}

/// Matches a character class body (after `[`). Returns whether `ch` is in
/// the class and the pattern remainder after the closing `]`.
fn match_class(pat: &[char], ch: Option<char>) -> Result<(bool, &[char])> {
    let mut i = 0;
    let negated = matches!(pat.first(), Some('^') | Some('!'));
    if negated {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    loop {
        if i >= pat.len() {
            return Err(BuildError::Pattern("unterminated character class".into()));
        }
        if pat[i] == ']' && !first {
            i += 1;
            break;
        }
        first = false;
        let lo = if pat[i] == '\\' {
            i += 1;
            if i >= pat.len() {
                return Err(BuildError::Pattern("trailing escape in class".into()));
            }
            pat[i]
        } else {
            pat[i]
        };
        i += 1;
        let hi = if i + 1 < pat.len() && pat[i] == '-' && pat[i + 1] != ']' {
            i += 1;
            let h = pat[i];
            i += 1;
            h
        } else {
            lo
        };
        if let Some(c) = ch {
            if c >= lo && c <= hi {
                matched = true;
            }
        }
    }
    Ok((matched ^ negated, &pat[i..]))
}

fn match_segments(pat: &[&str], path: &[&str]) -> Result<bool> {
    if pat.is_empty() {
        return Ok(path.is_empty());
    }
    if pat[0] == "**" {
        // `**` may swallow any number of leading path segments.
        for skip in 0..=path.len() {
            if match_segments(&pat[1..], &path[skip..])? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    if path.is_empty() {
        return Ok(false);
    }
    let p: Vec<char> = pat[0].chars().collect();
    let n: Vec<char> = path[0].chars().collect();
    if !match_component(&p, &n)? {
        return Ok(false);
    }
    match_segments(&pat[1..], &path[1..])
}

/// Whole-pattern match of `pattern` against a cleaned relative `path`.
///
/// `**` crosses directory boundaries; `*` does not. A whole pattern of
/// `*` or `**` (in any of its spellings) matches everything.
pub fn matches(pattern: &str, path: &str) -> Result<bool> {
    let pattern = clean(pattern);
    let path = clean(&path.replace('\\', "/"));
    if pattern == "*" || pattern == "**" || pattern == "." {
        return Ok(true);
    }
    if path == "." {
        return Ok(false);
    }
    let pat: Vec<&str> = pattern.split('/').collect();
    let segs: Vec<&str> = path.split('/').collect();
    match_segments(&pat, &segs)
}

/// One parsed ignore rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnorePattern {
    /// Cleaned pattern text, `!` prefix already stripped.
    pub pattern: String,
    pub negated: bool,
}

/// An ordered ignore rule set. Later rules override earlier matches.
#[derive(Debug, Clone, Default)]
pub struct IgnorePatterns {
    patterns: Vec<IgnorePattern>,
}

impl IgnorePatterns {
    pub fn new(patterns: Vec<IgnorePattern>) -> Self {
        Self { patterns }
    }

    /// Returns the verdict of the last rule matching `path` (or one of its
    /// ancestors): `Some(negated)` when some rule matched, `None` otherwise.
    pub fn matched(&self, path: &str) -> Result<Option<bool>> {
        let path = clean(path);
        let mut verdict = None;
        for rule in &self.patterns {
            if Self::matches_with_ancestors(&rule.pattern, &path)? {
                verdict = Some(rule.negated);
            }
        }
        Ok(verdict)
    }

    /// A path is excluded iff the last matching rule is non-negated.
    pub fn excluded(&self, path: &str) -> Result<bool> {
        Ok(matches!(self.matched(path)?, Some(false)))
    }

    /// A pattern matching a parent directory also matches everything under it.
    fn matches_with_ancestors(pattern: &str, path: &str) -> Result<bool> {
        if matches(pattern, path)? {
            return Ok(true);
        }
        let segs: Vec<&str> = path.split('/').collect();
        for end in 1..segs.len() {
            if matches(pattern, &segs[..end].join("/"))? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// True when some negation rule could re-include a path under `dir`,
    /// meaning an excluded `dir` must still be descended into.
    pub fn negation_reaches(&self, dir: &str) -> bool {
        let dir = clean(dir);
        let dir_segs: Vec<&str> = dir.split('/').collect();
        self.patterns.iter().filter(|p| p.negated).any(|p| {
            let pat_segs: Vec<&str> = p.pattern.split('/').collect();
            prefix_could_match(&pat_segs, &dir_segs)
        })
    }
}

/// Whether the first segments of `pat` could match all of `dir`, so that a
/// longer path under `dir` might match the full pattern.
fn prefix_could_match(pat: &[&str], dir: &[&str]) -> bool {
    if dir.is_empty() {
        return true;
    }
    if pat.is_empty() {
        return false;
    }
    if pat[0] == "**" {
        return true;
    }
    let p: Vec<char> = pat[0].chars().collect();
    let n: Vec<char> = dir[0].chars().collect();
    match match_component(&p, &n) {
        Ok(true) => prefix_could_match(&pat[1..], &dir[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean("./foo"), "foo");
        assert_eq!(clean("foo//bar"), "foo/bar");
        assert_eq!(clean("foo/./bar"), "foo/bar");
        assert_eq!(clean("foo/../bar"), "bar");
        assert_eq!(clean("dir1/../foo2"), "foo2");
        assert_eq!(clean("."), ".");
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        assert!(matches("*.txt", "a.txt").unwrap());
        assert!(!matches("*.txt", "dir/a.txt").unwrap());
        assert!(matches("dir/*.txt", "dir/a.txt").unwrap());
    }

    #[test]
    fn test_double_star_crosses_segments() {
        assert!(matches("**/foo", "foo").unwrap());
        assert!(matches("**/foo", "a/b/foo").unwrap());
        assert!(matches("a/**/b", "a/b").unwrap());
        assert!(matches("a/**/b", "a/x/y/b").unwrap());
        assert!(!matches("a/**/b", "a/x/y/c").unwrap());
    }

    #[test]
    fn test_exclude_everything_spellings() {
        for pat in ["*", "**", "**/", "**/**"] {
            assert!(matches(pat, "foo").unwrap(), "pattern {pat}");
            assert!(matches(pat, "a/b/c").unwrap(), "pattern {pat}");
        }
    }

    #[test]
    fn test_question_mark_and_class() {
        assert!(matches("fo?", "foo").unwrap());
        assert!(!matches("fo?", "fooo").unwrap());
        assert!(matches("[a-c].txt", "b.txt").unwrap());
        assert!(!matches("[a-c].txt", "d.txt").unwrap());
        assert!(matches("[!a-c].txt", "d.txt").unwrap());
    }

    #[test]
    fn test_escaped_star_is_literal() {
        assert!(matches("a\\*b", "a*b").unwrap());
        assert!(!matches("a\\*b", "axb").unwrap());
    }

    #[test]
    fn test_unterminated_class_is_error() {
        assert!(matches("[abc", "a").is_err());
    }

    #[test]
    fn test_last_match_wins() {
        let rules = IgnorePatterns::new(vec![
            IgnorePattern {
                pattern: "docs".into(),
                negated: false,
            },
            IgnorePattern {
                pattern: "docs/README.md".into(),
                negated: true,
            },
        ]);
        assert!(rules.excluded("docs/other.md").unwrap());
        assert!(!rules.excluded("docs/README.md").unwrap());
        assert!(rules.excluded("docs").unwrap());
    }

    #[test]
    fn test_dir_pattern_covers_children() {
        let rules = IgnorePatterns::new(vec![IgnorePattern {
            pattern: "node_modules".into(),
            negated: false,
        }]);
        assert!(rules.excluded("node_modules/a/b.js").unwrap());
        assert!(!rules.excluded("src/a.js").unwrap());
    }

    #[test]
    fn test_negation_reaches() {
        let rules = IgnorePatterns::new(vec![
            IgnorePattern {
                pattern: "build".into(),
                negated: false,
            },
            IgnorePattern {
                pattern: "build/keep/me.txt".into(),
                negated: true,
            },
        ]);
        assert!(rules.negation_reaches("build"));
        assert!(rules.negation_reaches("build/keep"));
        assert!(!rules.negation_reaches("src"));
    }

    #[test]
    fn test_cleaned_pattern_equivalence() {
        assert!(matches("./foo", "foo").unwrap());
        assert!(matches("dir1//foo", "dir1/foo").unwrap());
        assert!(matches("./dir1/../foo2", "foo2").unwrap());
    }
}
