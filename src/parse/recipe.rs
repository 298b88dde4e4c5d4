use crate::error::{BuildError, Result};
use crate::expand::ShellLex;
use crate::parse::instruction::{
    CommandExpr, Instruction, InstructionLine, KeyValue, parse_command_expr, parse_json_argv,
};

pub const DEFAULT_ESCAPE: char = '\\';

/// A parsed recipe: the ordered instruction list plus the escape character
/// in effect for the whole document.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub instructions: Vec<InstructionLine>,
    pub escape_char: char,
}

impl Recipe {
    pub fn parse(text: &str) -> Result<Self> {
        let escape_char = parse_escape_directive(text);
        let logical = preprocess(text, escape_char);
        if logical.is_empty() {
            return Err(BuildError::parse(1, "file with no instructions"));
        }

        let mut instructions = Vec::with_capacity(logical.len());
        for (line, raw) in logical {
            let instruction = parse_instruction_text(&raw, line, escape_char)?;
            instructions.push(InstructionLine {
                instruction,
                line,
                raw,
            });
        }

        if !matches!(instructions[0].instruction, Instruction::From { .. }) {
            return Err(BuildError::parse(
                instructions[0].line,
                "first instruction must be FROM",
            ));
        }

        Ok(Self {
            instructions,
            escape_char,
        })
    }

    /// Total number of steps for `Step N/M` progress lines. FROM is step 1.
    pub fn total_steps(&self) -> usize {
        self.instructions.len()
    }

    /// Parses one stored ONBUILD trigger when a child build replays it.
    pub fn parse_trigger(trigger: &str, escape_char: char) -> Result<InstructionLine> {
        let instruction = parse_instruction_text(trigger, 0, escape_char)?;
        Ok(InstructionLine {
            instruction,
            line: 0,
            raw: trigger.trim().to_string(),
        })
    }
}

/// Reads a leading `# escape=` parser directive. Only the top of the file
/// counts: the first line that is neither blank nor a directive comment ends
/// the directive block.
fn parse_escape_directive(text: &str) -> char {
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(comment) = trimmed.strip_prefix('#') {
            let comment = comment.trim();
            if let Some(value) = comment
                .to_lowercase()
                .strip_prefix("escape")
                .and_then(|r| r.trim_start().strip_prefix('='))
            {
                let value = value.trim();
                if value == "`" {
                    return '`';
                }
                if value == "\\" {
                    return DEFAULT_ESCAPE;
                }
            }
            // A plain comment before any directive ends directive parsing.
            return DEFAULT_ESCAPE;
        }
        break;
    }
    DEFAULT_ESCAPE
}

/// Joins continued lines and strips comments, yielding (start line, text)
/// logical lines. Blank and comment lines inside a continuation are dropped.
fn preprocess(text: &str, escape: char) -> Vec<(usize, String)> {
    let mut logical = Vec::new();
    let mut buf = String::new();
    let mut start_line = 0usize;

    for (idx, line) in text.lines().enumerate() {
        let number = idx + 1;
        let trimmed = line.trim();
        if buf.is_empty() {
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            start_line = number;
        } else if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let content = line.trim_end();
        if ends_with_continuation(content, escape) {
            buf.push_str(&content[..content.len() - escape.len_utf8()]);
        } else {
            buf.push_str(content);
            logical.push((start_line, buf.trim().to_string()));
            buf.clear();
        }
    }
    if !buf.is_empty() {
        logical.push((start_line, buf.trim().to_string()));
    }
    logical
}

/// A line continues iff it ends in an odd run of escape characters, so an
/// escaped escape does not join lines.
fn ends_with_continuation(line: &str, escape: char) -> bool {
    line.chars().rev().take_while(|c| *c == escape).count() % 2 == 1
}

fn parse_instruction_text(raw: &str, line: usize, escape: char) -> Result<Instruction> {
    let raw = raw.trim();
    let (keyword, rest) = match raw.split_once(char::is_whitespace) {
        Some((k, r)) => (k, r.trim()),
        None => (raw, ""),
    };
    let upper = keyword.to_uppercase();

    let requires_args = !matches!(upper.as_str(), "CMD" | "ENTRYPOINT");
    if rest.is_empty() && requires_args {
        return Err(BuildError::parse(
            line,
            format!("{upper} requires at least one argument"),
        ));
    }

    let lex = ShellLex::new(escape);
    match upper.as_str() {
        "FROM" => parse_from(rest, line),
        "RUN" => Ok(Instruction::Run {
            expr: parse_command_expr(rest),
        }),
        "CMD" => Ok(Instruction::Cmd {
            expr: parse_cmd_expr(rest),
        }),
        "ENTRYPOINT" => Ok(Instruction::Entrypoint {
            expr: parse_cmd_expr(rest),
        }),
        "COPY" => parse_copy_like(rest, line, &lex, false),
        "ADD" => parse_copy_like(rest, line, &lex, true),
        "ENV" => Ok(Instruction::Env {
            vars: parse_key_values(rest, line, &lex)?,
        }),
        "LABEL" => Ok(Instruction::Label {
            labels: parse_key_values(rest, line, &lex)?,
        }),
        "ARG" => parse_arg(rest, line, &lex),
        "WORKDIR" => Ok(Instruction::Workdir {
            path: rest.to_string(),
        }),
        "USER" => Ok(Instruction::User {
            spec: rest.to_string(),
        }),
        "VOLUME" => Ok(Instruction::Volume {
            args: rest.to_string(),
        }),
        "EXPOSE" => Ok(Instruction::Expose {
            args: rest.to_string(),
        }),
        "ONBUILD" => parse_onbuild(rest, line, escape),
        "SHELL" => match parse_json_argv(rest) {
            Some(shell) if !shell.is_empty() => Ok(Instruction::Shell { shell }),
            _ => Err(BuildError::parse(
                line,
                "SHELL requires the arguments to be in JSON form",
            )),
        },
        "STOPSIGNAL" => Ok(Instruction::StopSignal {
            signal: rest.to_string(),
        }),
        "MAINTAINER" => Ok(Instruction::Maintainer {
            name: rest.to_string(),
        }),
        _ => Err(BuildError::parse(
            line,
            format!("Unknown instruction: {upper}"),
        )),
    }
}

fn parse_from(rest: &str, line: usize) -> Result<Instruction> {
    let words: Vec<&str> = rest.split_whitespace().collect();
    match words.as_slice() {
        [image] => Ok(Instruction::From {
            image: image.to_string(),
            alias: None,
        }),
        [image, kw, alias] if kw.eq_ignore_ascii_case("as") => Ok(Instruction::From {
            image: image.to_string(),
            alias: Some(alias.to_string()),
        }),
        _ => Err(BuildError::parse(
            line,
            "FROM requires either one or three arguments",
        )),
    }
}

/// CMD/ENTRYPOINT tolerate an empty argument list (empty exec form).
fn parse_cmd_expr(rest: &str) -> CommandExpr {
    if rest.is_empty() {
        CommandExpr::Exec(Vec::new())
    } else {
        parse_command_expr(rest)
    }
}

fn parse_copy_like(rest: &str, line: usize, lex: &ShellLex, add: bool) -> Result<Instruction> {
    let keyword = if add { "ADD" } else { "COPY" };
    let mut words = match parse_json_argv(rest) {
        Some(argv) => argv,
        None => lex.split_words(rest),
    };
    if let Some(flag) = words.iter().find(|w| w.starts_with("--")) {
        return Err(BuildError::parse(
            line,
            format!("{keyword} flags are not supported: {flag}"),
        ));
    }
    if words.len() < 2 {
        return Err(BuildError::parse(
            line,
            format!("{keyword} requires at least two arguments"),
        ));
    }
    let destination = words.pop().expect("checked length above");
    if add {
        Ok(Instruction::Add {
            sources: words,
            destination,
        })
    } else {
        Ok(Instruction::Copy {
            sources: words,
            destination,
        })
    }
}

/// ENV/LABEL arguments: `key=value key2=value2 ...` multi-assignment, or the
/// legacy `key the rest is the value` single-pair form.
fn parse_key_values(rest: &str, line: usize, lex: &ShellLex) -> Result<Vec<KeyValue>> {
    let words = lex.split_words(rest);
    let first = words.first().expect("empty args rejected earlier");
    if !key_of(first).1 {
        // Legacy form: everything after the key is one raw value.
        let key = first.clone();
        let value = rest[key.len()..].trim().to_string();
        return Ok(vec![KeyValue { key, value }]);
    }
    let mut pairs = Vec::with_capacity(words.len());
    for word in words {
        let (key, has_eq) = key_of(&word);
        if !has_eq {
            return Err(BuildError::parse(
                line,
                format!("Syntax error - can't find = in \"{word}\". Must be of the form: name=value"),
            ));
        }
        let value = word[key.len() + 1..].to_string();
        pairs.push(KeyValue { key, value });
    }
    Ok(pairs)
}

/// Splits a word at its first unquoted `=`. Returns (key, found).
fn key_of(word: &str) -> (String, bool) {
    for (i, c) in word.char_indices() {
        match c {
            '=' => return (word[..i].to_string(), true),
            '\'' | '"' => break,
            _ => {}
        }
    }
    (word.to_string(), false)
}

fn parse_arg(rest: &str, line: usize, lex: &ShellLex) -> Result<Instruction> {
    let words = lex.split_words(rest);
    if words.len() != 1 {
        return Err(BuildError::parse(line, "ARG requires exactly one argument"));
    }
    let word = &words[0];
    match key_of(word) {
        (key, true) => Ok(Instruction::Arg {
            default: Some(word[key.len() + 1..].to_string()),
            name: key,
        }),
        (name, false) => Ok(Instruction::Arg {
            name,
            default: None,
        }),
    }
}

fn parse_onbuild(rest: &str, line: usize, escape: char) -> Result<Instruction> {
    let trigger_keyword = rest
        .split_whitespace()
        .next()
        .expect("empty args rejected earlier")
        .to_uppercase();
    match trigger_keyword.as_str() {
        "ONBUILD" => {
            return Err(BuildError::parse(
                line,
                "Chaining ONBUILD via `ONBUILD ONBUILD` isn't allowed",
            ));
        }
        "FROM" | "MAINTAINER" => {
            return Err(BuildError::parse(
                line,
                format!("{trigger_keyword} isn't allowed as an ONBUILD trigger"),
            ));
        }
        _ => {}
    }
    // The trigger must itself be parseable now, even though it only runs in
    // a child build.
    parse_instruction_text(rest, line, escape)?;
    Ok(Instruction::Onbuild {
        trigger: rest.trim().to_string(),
    })
}
