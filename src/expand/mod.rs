use std::iter::Peekable;
use std::str::Chars;

use crate::error::{BuildError, Result};

/// Shell-subset word processor used to expand build-time variables inside
/// instruction arguments.
///
/// Supported forms: `$NAME`, `${NAME}`, `${NAME:-default}`, `${NAME:+alt}`.
/// Single quotes suppress expansion and escapes, double quotes expand but
/// keep whitespace together, and the recipe's escape character placed before
/// `$` suppresses that one expansion.
pub struct ShellLex {
    escape: char,
}

impl ShellLex {
    pub fn new(escape: char) -> Self {
        Self { escape }
    }

    /// Splits a raw argument string into words at unquoted, unescaped
    /// whitespace. Quotes and escapes are retained verbatim; they are only
    /// consumed later by `process_word`.
    pub fn split_words(&self, s: &str) -> Vec<String> {
        let mut words = Vec::new();
        let mut cur = String::new();
        let mut chars = s.chars().peekable();
        let mut quote: Option<char> = None;

        while let Some(c) = chars.next() {
            match quote {
                Some(q) => {
                    cur.push(c);
                    if c == self.escape && q == '"' {
                        if let Some(&n) = chars.peek() {
                            cur.push(n);
                            chars.next();
                        }
                    } else if c == q {
                        quote = None;
                    }
                }
                None => {
                    if c.is_whitespace() {
                        if !cur.is_empty() {
                            words.push(std::mem::take(&mut cur));
                        }
                    } else if c == self.escape {
                        cur.push(c);
                        if let Some(&n) = chars.peek() {
                            cur.push(n);
                            chars.next();
                        }
                    } else {
                        if c == '\'' || c == '"' {
                            quote = Some(c);
                        }
                        cur.push(c);
                    }
                }
            }
        }
        if !cur.is_empty() {
            words.push(cur);
        }
        words
    }

    /// Expands variable references in one word and strips its quoting.
    pub fn process_word(
        &self,
        word: &str,
        resolve: &dyn Fn(&str) -> Option<String>,
    ) -> Result<String> {
        let mut out = String::new();
        let mut chars = word.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\'' => {
                    let mut closed = false;
                    for q in chars.by_ref() {
                        if q == '\'' {
                            closed = true;
                            break;
                        }
                        out.push(q);
                    }
                    if !closed {
                        return Err(BuildError::Expansion {
                            word: word.to_string(),
                            message: "unexpected end of statement while looking for matching single-quote".into(),
                        });
                    }
                }
                '"' => {
                    let mut closed = false;
                    while let Some(q) = chars.next() {
                        if q == '"' {
                            closed = true;
                            break;
                        }
                        if q == self.escape {
                            match chars.peek() {
                                Some(&n) if n == '$' || n == '"' || n == self.escape => {
                                    out.push(n);
                                    chars.next();
                                }
                                _ => out.push(q),
                            }
                        } else if q == '$' {
                            out.push_str(&self.expand_ref(word, &mut chars, resolve)?);
                        } else {
                            out.push(q);
                        }
                    }
                    if !closed {
                        return Err(BuildError::Expansion {
                            word: word.to_string(),
                            message: "unexpected end of statement while looking for matching double-quote".into(),
                        });
                    }
                }
                _ if c == self.escape => match chars.next() {
                    Some(n) => out.push(n),
                    None => out.push(c),
                },
                '$' => out.push_str(&self.expand_ref(word, &mut chars, resolve)?),
                _ => out.push(c),
            }
        }
        Ok(out)
    }

    /// Splits, expands, and re-splits. An unquoted word whose expansion
    /// contains whitespace yields multiple words; an unquoted word expanding
    /// to nothing yields none.
    pub fn process_words(
        &self,
        s: &str,
        resolve: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for raw in self.split_words(s) {
            let quoted = raw.contains('\'') || raw.contains('"');
            let processed = self.process_word(&raw, resolve)?;
            if quoted {
                out.push(processed);
            } else {
                out.extend(
                    processed
                        .split_whitespace()
                        .map(str::to_string),
                );
            }
        }
        Ok(out)
    }

    fn expand_ref(
        &self,
        word: &str,
        chars: &mut Peekable<Chars<'_>>,
        resolve: &dyn Fn(&str) -> Option<String>,
    ) -> Result<String> {
        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut body = String::new();
                let mut depth = 1usize;
                for c in chars.by_ref() {
                    match c {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    body.push(c);
                }
                if depth != 0 {
                    return Err(BuildError::Expansion {
                        word: word.to_string(),
                        message: "syntax error: missing '}'".into(),
                    });
                }
                self.expand_braced(word, &body, resolve)
            }
            _ => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
                    // Not a variable reference; `$` stays literal.
                    let mut lit = String::from("$");
                    lit.push_str(&name);
                    return Ok(lit);
                }
                Ok(resolve(&name).unwrap_or_default())
            }
        }
    }

    fn expand_braced(
        &self,
        word: &str,
        body: &str,
        resolve: &dyn Fn(&str) -> Option<String>,
    ) -> Result<String> {
        let Some(colon) = body.find(':') else {
            if body.is_empty() {
                return Err(BuildError::Expansion {
                    word: word.to_string(),
                    message: "syntax error: bad substitution".into(),
                });
            }
            return Ok(resolve(body).unwrap_or_default());
        };
        let name = &body[..colon];
        let rest = &body[colon + 1..];
        let Some(op) = rest.chars().next() else {
            return Err(BuildError::Expansion {
                word: word.to_string(),
                message: "syntax error: bad substitution".into(),
            });
        };
        let operand = &rest[op.len_utf8()..];
        // The operand may itself contain references.
        let operand = self.process_word(operand, resolve)?;
        let value = resolve(name).filter(|v| !v.is_empty());
        match op {
            '-' => Ok(value.unwrap_or(operand)),
            '+' => Ok(if value.is_some() { operand } else { String::new() }),
            other => Err(BuildError::Expansion {
                word: word.to_string(),
                message: format!("unsupported modifier ({other}) in substitution"),
            }),
        }
    }
}
