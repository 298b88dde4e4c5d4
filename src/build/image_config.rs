use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use oci_spec::image::{Config, ConfigBuilder};
use serde::{Deserialize, Serialize};

pub static DEFAULT_PATH: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub static DEFAULT_SHELL: &[&str] = &["/bin/sh", "-c"];

/// Runtime configuration accumulated while a stage executes. Every committed
/// step snapshots one of these; it also feeds cache fingerprints, so the
/// serialized form must be deterministic (ordered collections throughout).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    /// `KEY=value` entries in declaration order; redefinition replaces in
    /// place rather than appending.
    pub env: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub shell: Option<Vec<String>>,
    pub user: String,
    pub workdir: String,
    pub labels: BTreeMap<String, String>,
    pub exposed_ports: BTreeSet<String>,
    pub volumes: BTreeSet<String>,
    pub stop_signal: Option<String>,
    pub author: Option<String>,
    pub onbuild: Vec<String>,
}

impl ImageConfig {
    /// Starting configuration for a `FROM scratch` stage.
    pub fn scratch() -> Self {
        Self {
            env: vec![DEFAULT_PATH.to_string()],
            ..Self::default()
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        let entry = format!("{key}={value}");
        for existing in self.env.iter_mut() {
            let name = existing.split('=').next().unwrap_or(existing);
            if env_name_matches(name, key) {
                *existing = entry;
                return self;
            }
        }
        self.env.push(entry);
        self
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (name, value) = entry.split_once('=')?;
            env_name_matches(name, key).then_some(value)
        })
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Records an exposed port. A bare number defaults to tcp, so `EXPOSE 80`
    /// and `EXPOSE 80/tcp` are the same declaration.
    pub fn with_exposed_port(mut self, port: &str) -> Self {
        let normalized = if port.contains('/') {
            port.to_lowercase()
        } else {
            format!("{port}/tcp")
        };
        self.exposed_ports.insert(normalized);
        self
    }

    pub fn with_volume(mut self, path: &str) -> Self {
        self.volumes.insert(path.to_string());
        self
    }

    pub fn with_entrypoint(mut self, entrypoint: Option<Vec<String>>) -> Self {
        self.entrypoint = entrypoint;
        self
    }

    pub fn with_cmd(mut self, cmd: Option<Vec<String>>) -> Self {
        self.cmd = cmd;
        self
    }

    pub fn with_shell(mut self, shell: Vec<String>) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    pub fn with_workdir(mut self, workdir: &str) -> Self {
        self.workdir = workdir.to_string();
        self
    }

    pub fn with_stop_signal(mut self, signal: &str) -> Self {
        self.stop_signal = Some(signal.to_string());
        self
    }

    pub fn with_author(mut self, author: &str) -> Self {
        self.author = Some(author.to_string());
        self
    }

    pub fn with_onbuild(mut self, trigger: &str) -> Self {
        self.onbuild.push(trigger.to_string());
        self
    }

    /// Drops inherited ONBUILD triggers once they have fired in the direct
    /// child, so they never reach grandchildren.
    pub fn without_onbuild(mut self) -> Self {
        self.onbuild.clear();
        self
    }

    /// The argv prefix used to run shell-form RUN/CMD/ENTRYPOINT commands.
    pub fn shell_argv(&self) -> Vec<String> {
        self.shell
            .clone()
            .unwrap_or_else(|| DEFAULT_SHELL.iter().map(|s| s.to_string()).collect())
    }

    pub fn to_oci(&self) -> Result<Config> {
        let mut builder = ConfigBuilder::default().env(self.env.clone());
        if !self.user.is_empty() {
            builder = builder.user(self.user.clone());
        }
        if !self.workdir.is_empty() {
            builder = builder.working_dir(self.workdir.clone());
        }
        if let Some(entrypoint) = &self.entrypoint {
            builder = builder.entrypoint(entrypoint.clone());
        }
        if let Some(cmd) = &self.cmd {
            builder = builder.cmd(cmd.clone());
        }
        if !self.labels.is_empty() {
            builder = builder.labels(
                self.labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<std::collections::HashMap<_, _>>(),
            );
        }
        if !self.exposed_ports.is_empty() {
            builder = builder.exposed_ports(self.exposed_ports.iter().cloned().collect::<Vec<_>>());
        }
        if !self.volumes.is_empty() {
            builder = builder.volumes(self.volumes.iter().cloned().collect::<Vec<_>>());
        }
        if let Some(signal) = &self.stop_signal {
            builder = builder.stop_signal(signal.clone());
        }
        builder.build().context("Failed to build OCI config")
    }
}

#[cfg(windows)]
fn env_name_matches(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[cfg(not(windows))]
fn env_name_matches(a: &str, b: &str) -> bool {
    a == b
}
