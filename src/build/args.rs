use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;

/// Proxy variables usable from the command line without an ARG declaration
/// and exempt from the unused-argument warning.
static BUILTIN_ARGS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "HTTP_PROXY",
        "http_proxy",
        "HTTPS_PROXY",
        "https_proxy",
        "FTP_PROXY",
        "ftp_proxy",
        "NO_PROXY",
        "no_proxy",
    ])
});

/// Ledger of build-time arguments for one stage: what ARG declared, what the
/// command line supplied, and which command-line values were actually used.
#[derive(Debug, Default, Clone)]
pub struct BuildArgs {
    declared: HashMap<String, Option<String>>,
    cli_values: HashMap<String, String>,
    consumed: HashSet<String>,
}

impl BuildArgs {
    pub fn new(cli_values: HashMap<String, String>) -> Self {
        Self {
            cli_values,
            ..Self::default()
        }
    }

    /// Registers an ARG declaration. A later redeclaration replaces the
    /// default.
    pub fn declare(&mut self, name: &str, default: Option<String>) {
        self.declared.insert(name.to_string(), default);
    }

    /// Resolves a reference against declared arguments. Command-line values
    /// override defaults but only for declared or builtin names.
    pub fn resolve(&mut self, name: &str) -> Option<String> {
        let usable = self.declared.contains_key(name) || BUILTIN_ARGS.contains(name);
        if !usable {
            return None;
        }
        if let Some(value) = self.cli_values.get(name) {
            self.consumed.insert(name.to_string());
            return Some(value.clone());
        }
        self.declared.get(name).cloned().flatten()
    }

    pub fn declared_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.declared.keys().cloned().collect();
        names.sort();
        names
    }

    /// Command-line arguments never consumed by any instruction, sorted.
    /// Proxy builtins are exempt.
    pub fn unconsumed(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .cli_values
            .keys()
            .filter(|k| !self.consumed.contains(*k) && !BUILTIN_ARGS.contains(k.as_str()))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// The warning emitted once at the end of a build with leftover
    /// command-line arguments.
    pub fn unconsumed_warning(&self) -> Option<String> {
        let names = self.unconsumed();
        if names.is_empty() {
            return None;
        }
        Some(format!(
            "One or more build-args [{}] were not consumed",
            names.join(", ")
        ))
    }
}
