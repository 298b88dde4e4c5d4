use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use sha256::try_digest;
use tracing::{debug, warn};

use crate::build::args::BuildArgs;
use crate::build::cache::{CachedStep, LayerGraph, step_fingerprint};
use crate::build::image_config::ImageConfig;
use crate::build::user::UserSpec;
use crate::context::walk::has_glob_meta;
use crate::context::{BuildContext, EntryKind};
use crate::error::BuildError;
use crate::expand::ShellLex;
use crate::parse::{CommandExpr, Instruction, InstructionLine, KeyValue, Recipe};
use crate::runtime::local::sniff_archive;
use crate::runtime::{
    CopyItem, MaterializeRequest, RemoteFetcher, RemovalPolicy, RunRequest, RuntimeExecutor,
};
use crate::store::{BaseImage, Layer, LayerStore};

/// What one stage leaves behind: the image identity at its last step, the
/// accumulated configuration, and the layer chain. Later stages can FROM it
/// by alias or index, and the final stage's outcome is what gets committed.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub image_id: String,
    pub config: ImageConfig,
    pub layers: Vec<Layer>,
}

/// StageExecutor bundles up what we need to know when executing one stage of
/// a (possibly multi-stage) build.
///
/// Each stage starts from its own base image, so it carries its own
/// configuration and layer chain. Per instruction it expands arguments,
/// computes the step fingerprint, and either adopts a cached step or
/// delegates to the runtime collaborator and commits a fresh layer.
///
/// [Reference](https://github.com/containers/buildah/blob/main/imagebuildah/stage_executor.go)
pub struct StageExecutor<'a> {
    store: &'a mut dyn LayerStore,
    runtime: &'a dyn RuntimeExecutor,
    fetcher: &'a dyn RemoteFetcher,
    graph: &'a mut LayerGraph,
    context: &'a BuildContext,
    args: &'a mut BuildArgs,
    stage_results: &'a HashMap<String, StageOutcome>,
    no_cache: bool,
    removal: RemovalPolicy,
    escape: char,

    parent_id: String,
    config: ImageConfig,
    layers: Vec<Layer>,
}

impl<'a> StageExecutor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &'a mut dyn LayerStore,
        runtime: &'a dyn RuntimeExecutor,
        fetcher: &'a dyn RemoteFetcher,
        graph: &'a mut LayerGraph,
        context: &'a BuildContext,
        args: &'a mut BuildArgs,
        stage_results: &'a HashMap<String, StageOutcome>,
        no_cache: bool,
        removal: RemovalPolicy,
        escape: char,
    ) -> Self {
        Self {
            store,
            runtime,
            fetcher,
            graph,
            context,
            args,
            stage_results,
            no_cache,
            removal,
            escape,
            parent_id: String::new(),
            config: ImageConfig::default(),
            layers: Vec::new(),
        }
    }

    /// Runs one stage's instructions. `step_offset` is the number of steps
    /// already executed in earlier stages; numbering is continuous across the
    /// whole recipe and includes FROM.
    pub fn execute(
        &mut self,
        instructions: &[InstructionLine],
        step_offset: usize,
        total: usize,
    ) -> Result<StageOutcome> {
        for (i, line) in instructions.iter().enumerate() {
            println!("Step {}/{} : {}", step_offset + i + 1, total, line.raw);
            self.execute_instruction(&line.instruction)
                .with_context(|| format!("Failed to execute: {}", line.raw))?;
            println!(" ---> {}", short_id(&self.parent_id));
        }
        Ok(StageOutcome {
            image_id: self.parent_id.clone(),
            config: self.config.clone(),
            layers: self.layers.clone(),
        })
    }

    fn execute_instruction(&mut self, instruction: &Instruction) -> Result<()> {
        debug!(keyword = instruction.keyword(), "executing instruction");
        match instruction {
            Instruction::From { image, .. } => self.execute_from(image),
            Instruction::Run { expr } => self.execute_run(expr),
            Instruction::Copy {
                sources,
                destination,
            } => self.execute_copy(sources, destination, false),
            Instruction::Add {
                sources,
                destination,
            } => self.execute_copy(sources, destination, true),
            Instruction::Env { vars } => self.execute_env(vars),
            Instruction::Arg { name, default } => self.execute_arg(name, default.as_deref()),
            Instruction::Label { labels } => self.execute_label(labels),
            Instruction::Workdir { path } => self.execute_workdir(path),
            Instruction::User { spec } => self.execute_user(spec),
            Instruction::Volume { args } => self.execute_volume(args),
            Instruction::Expose { args } => self.execute_expose(args),
            Instruction::Onbuild { trigger } => self.execute_onbuild(trigger),
            Instruction::Shell { shell } => self.execute_shell(shell),
            Instruction::StopSignal { signal } => self.execute_stop_signal(signal),
            Instruction::Maintainer { name } => self.execute_maintainer(name),
            Instruction::Cmd { expr } => self.execute_cmd(expr, false),
            Instruction::Entrypoint { expr } => self.execute_cmd(expr, true),
        }
    }

    fn execute_from(&mut self, image: &str) -> Result<()> {
        let base = self.resolve_base(image)?;
        self.parent_id = base.image_id;
        self.config = base.config;
        self.layers = base.layers;

        // Inherited triggers fire in the direct child only, then vanish.
        let triggers = self.config.onbuild.clone();
        self.config = std::mem::take(&mut self.config).without_onbuild();
        if !triggers.is_empty() {
            println!(
                "# Executing {} build trigger{}",
                triggers.len(),
                if triggers.len() == 1 { "" } else { "s" }
            );
            for trigger in triggers {
                let line = Recipe::parse_trigger(&trigger, self.escape)?;
                self.execute_instruction(&line.instruction)
                    .with_context(|| format!("Failed to execute trigger: {trigger}"))?;
            }
        }
        Ok(())
    }

    fn resolve_base(&self, image: &str) -> Result<BaseImage> {
        if let Some(stage) = self.stage_results.get(image) {
            return Ok(BaseImage {
                image_id: stage.image_id.clone(),
                layers: stage.layers.clone(),
                config: stage.config.clone(),
            });
        }
        if image == "scratch" {
            return Ok(BaseImage {
                image_id: "scratch".to_string(),
                layers: Vec::new(),
                config: ImageConfig::scratch(),
            });
        }
        match self.store.resolve_base(image)? {
            Some(base) => Ok(base),
            None => Err(BuildError::execution(format!("no such image: {image}")).into()),
        }
    }

    fn execute_run(&mut self, expr: &CommandExpr) -> Result<()> {
        let (reference_text, argv) = match expr {
            CommandExpr::Shell(command) => {
                let mut argv = self.config.shell_argv();
                argv.push(command.clone());
                (command.clone(), argv)
            }
            CommandExpr::Exec(argv) => (argv.join(" "), argv.clone()),
        };
        if argv.is_empty() {
            return Err(
                BuildError::execution("RUN requires at least one argument".to_string()).into(),
            );
        }

        // Declared build args the command references ride along as env vars.
        let mut run_env = self.config.env.clone();
        let mut arg_entries = Vec::new();
        for name in self.args.declared_names() {
            if !references_var(&reference_text, &name) || self.config.get_env(&name).is_some() {
                continue;
            }
            if let Some(value) = self.args.resolve(&name) {
                arg_entries.push(format!("{name}={value}"));
                run_env.push(format!("{name}={value}"));
            }
        }

        let display = argv.join(" ");
        let cache_text = format!("RUN {argv:?} |{}", arg_entries.join(","));
        let fingerprint = step_fingerprint(&self.parent_id, &cache_text, &[]);
        if self.try_cache(&fingerprint) {
            return Ok(());
        }

        let rootfs_layers = self.layer_dirs()?;
        let user = self.active_user()?;
        let outcome = self.runtime.run(RunRequest {
            rootfs_layers,
            argv,
            env: run_env,
            workdir: self.config.workdir.clone(),
            user,
            removal: self.removal,
        })?;
        if outcome.exit_code != 0 {
            return Err(BuildError::Execution {
                message: format!(
                    "The command '{display}' returned a non-zero code: {}",
                    outcome.exit_code
                ),
                exit_code: outcome.exit_code,
            }
            .into());
        }

        let layer = match outcome.diff_dir {
            Some(diff) => {
                let layer = self.store.put_layer(&diff)?;
                if let Err(err) = fs::remove_dir_all(&diff) {
                    warn!(%err, "failed to remove diff dir {}", diff.display());
                }
                Some(layer)
            }
            None => None,
        };
        self.finish_step(fingerprint, layer)
    }

    fn execute_copy(&mut self, sources: &[String], destination: &str, add: bool) -> Result<()> {
        let keyword = if add { "ADD" } else { "COPY" };
        let mut expanded = Vec::with_capacity(sources.len());
        for source in sources {
            expanded.push(self.expand_word(source)?);
        }
        let dest_raw = self.expand_word(destination)?;

        struct Source {
            name: String,
            abs: PathBuf,
            is_dir: bool,
            remote: bool,
        }
        let mut resolved: Vec<Source> = Vec::new();
        let mut digests: Vec<String> = Vec::new();
        let mut matched_any = false;

        for source in &expanded {
            if add && (source.starts_with("http://") || source.starts_with("https://")) {
                let local = self.fetcher.fetch(source)?;
                digests.push(try_digest(&local).with_context(|| {
                    format!("Failed to digest fetched file {}", local.display())
                })?);
                let name = source.rsplit('/').next().unwrap_or("download").to_string();
                resolved.push(Source {
                    name,
                    abs: local,
                    is_dir: false,
                    remote: true,
                });
                matched_any = true;
                continue;
            }
            let entries = self.context.glob(source)?;
            if entries.is_empty() {
                if !has_glob_meta(source) {
                    return Err(BuildError::execution(format!(
                        "{keyword} failed: {source}: no such file or directory"
                    ))
                    .into());
                }
                continue;
            }
            matched_any = true;
            for entry in entries {
                digests.push(self.context.entry_digest(entry)?);
                let name = entry
                    .rel_path
                    .rsplit('/')
                    .next()
                    .unwrap_or(&entry.rel_path)
                    .to_string();
                resolved.push(Source {
                    name,
                    abs: entry.abs_path.clone(),
                    is_dir: entry.kind == EntryKind::Dir,
                    remote: false,
                });
            }
        }
        if !matched_any {
            return Err(BuildError::execution(format!(
                "{keyword} failed: no source files were specified"
            ))
            .into());
        }

        let cache_text = format!("{keyword} {expanded:?} {dest_raw}");
        let fingerprint = step_fingerprint(&self.parent_id, &cache_text, &digests);
        if self.try_cache(&fingerprint) {
            return Ok(());
        }

        let dest = self.absolute_dest(&dest_raw);
        let dir_semantics = dest_raw.ends_with('/')
            || dest_raw == "."
            || resolved.len() > 1
            || resolved.first().is_some_and(|s| s.is_dir)
            || self.dest_is_existing_dir(&dest)?;

        let mut items = Vec::with_capacity(resolved.len());
        for source in &resolved {
            // Fetched sources are copied verbatim, never unpacked.
            let is_archive =
                add && !source.is_dir && !source.remote && sniff_archive(&source.abs)?.is_some();
            let item_dest = if source.is_dir || is_archive {
                // Directory contents and archive members land under the
                // destination itself.
                dest.clone()
            } else if dir_semantics {
                format!("{}/{}", dest.trim_end_matches('/'), source.name)
            } else {
                dest.clone()
            };
            items.push(CopyItem {
                src: source.abs.clone(),
                dest: item_dest,
                extract: is_archive,
            });
        }

        let chown = match self.active_user()? {
            Some(spec) => spec.numeric().map(|(uid, gid)| (uid, gid.unwrap_or(uid))),
            None => None,
        };
        let diff = self.runtime.materialize(MaterializeRequest { items, chown })?;
        let layer = self.store.put_layer(&diff)?;
        if let Err(err) = fs::remove_dir_all(&diff) {
            warn!(%err, "failed to remove diff dir {}", diff.display());
        }
        self.finish_step(fingerprint, Some(layer))
    }

    fn execute_env(&mut self, vars: &[KeyValue]) -> Result<()> {
        let mut pairs = Vec::with_capacity(vars.len());
        for var in vars {
            pairs.push((var.key.clone(), self.expand_word(&var.value)?));
        }
        let rendered: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let fingerprint = self.config_fingerprint(&format!("ENV {}", rendered.join(" ")));
        if self.try_cache(&fingerprint) {
            return Ok(());
        }
        for (key, value) in &pairs {
            self.config = std::mem::take(&mut self.config).with_env(key, value);
        }
        self.finish_step(fingerprint, None)
    }

    fn execute_arg(&mut self, name: &str, default: Option<&str>) -> Result<()> {
        let default = match default {
            Some(d) => Some(self.expand_word(d)?),
            None => None,
        };
        let fingerprint = self.config_fingerprint(&format!(
            "ARG {name}={}",
            default.as_deref().unwrap_or_default()
        ));
        self.args.declare(name, default);
        if self.try_cache(&fingerprint) {
            return Ok(());
        }
        self.finish_step(fingerprint, None)
    }

    fn execute_label(&mut self, labels: &[KeyValue]) -> Result<()> {
        let mut pairs = Vec::with_capacity(labels.len());
        for label in labels {
            pairs.push((
                self.expand_word(&label.key)?,
                self.expand_word(&label.value)?,
            ));
        }
        let rendered: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let fingerprint = self.config_fingerprint(&format!("LABEL {}", rendered.join(" ")));
        if self.try_cache(&fingerprint) {
            return Ok(());
        }
        for (key, value) in &pairs {
            self.config = std::mem::take(&mut self.config).with_label(key, value);
        }
        self.finish_step(fingerprint, None)
    }

    fn execute_workdir(&mut self, path: &str) -> Result<()> {
        let path = self.expand_word(path)?;
        let absolute = if path.starts_with('/') {
            path
        } else {
            format!("{}/{path}", self.config.workdir.trim_end_matches('/'))
        };
        let fingerprint = self.config_fingerprint(&format!("WORKDIR {absolute}"));
        if self.try_cache(&fingerprint) {
            return Ok(());
        }
        self.config = std::mem::take(&mut self.config).with_workdir(&absolute);
        self.finish_step(fingerprint, None)
    }

    fn execute_user(&mut self, spec: &str) -> Result<()> {
        let spec = self.expand_word(spec)?;
        UserSpec::parse(&spec)?;
        let fingerprint = self.config_fingerprint(&format!("USER {spec}"));
        if self.try_cache(&fingerprint) {
            return Ok(());
        }
        self.config = std::mem::take(&mut self.config).with_user(&spec);
        self.finish_step(fingerprint, None)
    }

    fn execute_volume(&mut self, args: &str) -> Result<()> {
        let volumes = self.expand_words(args)?;
        if volumes.is_empty() || volumes.iter().any(|v| v.is_empty()) {
            return Err(BuildError::execution(
                "VOLUME specified can not be an empty string".to_string(),
            )
            .into());
        }
        let mut sorted = volumes.clone();
        sorted.sort();
        let fingerprint = self.config_fingerprint(&format!("VOLUME {}", sorted.join(" ")));
        if self.try_cache(&fingerprint) {
            return Ok(());
        }
        for volume in &volumes {
            self.config = std::mem::take(&mut self.config).with_volume(volume);
        }
        self.finish_step(fingerprint, None)
    }

    fn execute_expose(&mut self, args: &str) -> Result<()> {
        let ports = self.expand_words(args)?;
        let mut sorted = ports.clone();
        sorted.sort();
        let fingerprint = self.config_fingerprint(&format!("EXPOSE {}", sorted.join(" ")));
        if self.try_cache(&fingerprint) {
            return Ok(());
        }
        for port in &ports {
            self.config = std::mem::take(&mut self.config).with_exposed_port(port);
        }
        self.finish_step(fingerprint, None)
    }

    fn execute_onbuild(&mut self, trigger: &str) -> Result<()> {
        let fingerprint = self.config_fingerprint(&format!("ONBUILD {trigger}"));
        if self.try_cache(&fingerprint) {
            return Ok(());
        }
        self.config = std::mem::take(&mut self.config).with_onbuild(trigger);
        self.finish_step(fingerprint, None)
    }

    fn execute_shell(&mut self, shell: &[String]) -> Result<()> {
        let fingerprint = self.config_fingerprint(&format!("SHELL {shell:?}"));
        if self.try_cache(&fingerprint) {
            return Ok(());
        }
        self.config = std::mem::take(&mut self.config).with_shell(shell.to_vec());
        self.finish_step(fingerprint, None)
    }

    fn execute_stop_signal(&mut self, signal: &str) -> Result<()> {
        let signal = self.expand_word(signal)?;
        let fingerprint = self.config_fingerprint(&format!("STOPSIGNAL {signal}"));
        if self.try_cache(&fingerprint) {
            return Ok(());
        }
        self.config = std::mem::take(&mut self.config).with_stop_signal(&signal);
        self.finish_step(fingerprint, None)
    }

    fn execute_maintainer(&mut self, name: &str) -> Result<()> {
        let fingerprint = self.config_fingerprint(&format!("MAINTAINER {name}"));
        if self.try_cache(&fingerprint) {
            return Ok(());
        }
        self.config = std::mem::take(&mut self.config).with_author(name);
        self.finish_step(fingerprint, None)
    }

    fn execute_cmd(&mut self, expr: &CommandExpr, entrypoint: bool) -> Result<()> {
        let argv = match expr {
            CommandExpr::Shell(command) => {
                let mut argv = self.config.shell_argv();
                argv.push(command.clone());
                argv
            }
            CommandExpr::Exec(argv) => argv.clone(),
        };
        let keyword = if entrypoint { "ENTRYPOINT" } else { "CMD" };
        let fingerprint = self.config_fingerprint(&format!("{keyword} {argv:?}"));
        if self.try_cache(&fingerprint) {
            return Ok(());
        }
        self.config = if entrypoint {
            std::mem::take(&mut self.config).with_entrypoint(Some(argv))
        } else {
            std::mem::take(&mut self.config).with_cmd(Some(argv))
        };
        self.finish_step(fingerprint, None)
    }

    fn config_fingerprint(&self, text: &str) -> String {
        step_fingerprint(&self.parent_id, text, &[])
    }

    /// Adopts a cached step when caching is enabled and the exact
    /// (parent, fingerprint) pair is known.
    fn try_cache(&mut self, fingerprint: &str) -> bool {
        if self.no_cache {
            return false;
        }
        let Some(step) = self.graph.lookup(fingerprint).cloned() else {
            return false;
        };
        println!(" ---> Using cache");
        if let Some(layer) = &step.layer {
            self.layers.push(layer.clone());
        }
        self.config = step.config;
        self.parent_id = step.image_id;
        true
    }

    /// Commits a finished step: appends its layer, advances the parent, and
    /// records the fingerprint even for uncached builds so later builds can
    /// hit on it.
    fn finish_step(&mut self, fingerprint: String, layer: Option<Layer>) -> Result<()> {
        if let Some(layer) = &layer {
            self.layers.push(layer.clone());
        }
        self.parent_id = fingerprint.clone();
        self.graph.record(
            fingerprint.clone(),
            CachedStep {
                image_id: fingerprint,
                layer,
                config: self.config.clone(),
            },
        );
        Ok(())
    }

    /// Whether the destination already exists as a directory somewhere in
    /// the layer chain. A single-file copy onto such a path keeps its
    /// basename instead of renaming over the directory. Later layers
    /// override earlier ones.
    fn dest_is_existing_dir(&mut self, dest: &str) -> Result<bool> {
        let rel = dest.trim_start_matches('/');
        if rel.is_empty() {
            return Ok(true);
        }
        for dir in self.layer_dirs()?.iter().rev() {
            if let Ok(meta) = fs::symlink_metadata(dir.join(rel)) {
                return Ok(meta.is_dir());
            }
        }
        Ok(false)
    }

    fn layer_dirs(&mut self) -> Result<Vec<PathBuf>> {
        let layers = self.layers.clone();
        layers
            .iter()
            .map(|layer| self.store.layer_dir(layer))
            .collect()
    }

    fn active_user(&self) -> Result<Option<UserSpec>> {
        if self.config.user.is_empty() {
            return Ok(None);
        }
        Ok(Some(UserSpec::parse(&self.config.user)?))
    }

    fn absolute_dest(&self, dest: &str) -> String {
        let workdir = if self.config.workdir.is_empty() {
            "/"
        } else {
            &self.config.workdir
        };
        if dest == "." || dest == "./" {
            workdir.to_string()
        } else if let Some(rel) = dest.strip_prefix("./") {
            format!("{}/{rel}", workdir.trim_end_matches('/'))
        } else if dest.starts_with('/') {
            dest.to_string()
        } else {
            format!("{}/{dest}", workdir.trim_end_matches('/'))
        }
    }

    fn expand_word(&mut self, word: &str) -> Result<String> {
        let lex = ShellLex::new(self.escape);
        let config = &self.config;
        let args = RefCell::new(&mut *self.args);
        let resolve = |name: &str| {
            config
                .get_env(name)
                .map(str::to_string)
                .or_else(|| args.borrow_mut().resolve(name))
        };
        Ok(lex.process_word(word, &resolve)?)
    }

    fn expand_words(&mut self, raw: &str) -> Result<Vec<String>> {
        let lex = ShellLex::new(self.escape);
        let config = &self.config;
        let args = RefCell::new(&mut *self.args);
        let resolve = |name: &str| {
            config
                .get_env(name)
                .map(str::to_string)
                .or_else(|| args.borrow_mut().resolve(name))
        };
        Ok(lex.process_words(raw, &resolve)?)
    }
}

fn short_id(id: &str) -> &str {
    if id.len() > 12 { &id[..12] } else { id }
}

/// Whether a command's text mentions `$name` or `${name...}`.
fn references_var(text: &str, name: &str) -> bool {
    for (i, _) in text.match_indices('$') {
        let rest = &text[i + 1..];
        let body = rest.strip_prefix('{').unwrap_or(rest);
        if let Some(tail) = body.strip_prefix(name) {
            if !tail.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
                return true;
            }
        }
    }
    false
}
