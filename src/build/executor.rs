use std::collections::HashMap;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::build::BuildOptions;
use crate::build::args::BuildArgs;
use crate::build::cache::LayerGraph;
use crate::build::stage_executor::{StageExecutor, StageOutcome};
use crate::context::BuildContext;
use crate::error::BuildError;
use crate::parse::{Instruction, InstructionLine, Recipe};
use crate::runtime::{RemoteFetcher, RuntimeExecutor};
use crate::store::LayerStore;

/// A finished build: the committed image id plus any non-fatal warnings
/// collected along the way.
#[derive(Debug)]
pub struct BuildReport {
    pub image_id: String,
    pub warnings: Vec<String>,
}

/// Executor coordinates the entire build by using one StageExecutor per
/// stage, then committing the last stage's outcome as the tagged image.
///
/// [Reference](https://github.com/containers/buildah/blob/main/imagebuildah/executor.go)
pub struct Executor<'a> {
    store: &'a mut dyn LayerStore,
    runtime: &'a dyn RuntimeExecutor,
    fetcher: &'a dyn RemoteFetcher,
    context: &'a BuildContext,
    options: BuildOptions,
}

impl<'a> Executor<'a> {
    pub fn new(
        store: &'a mut dyn LayerStore,
        runtime: &'a dyn RuntimeExecutor,
        fetcher: &'a dyn RemoteFetcher,
        context: &'a BuildContext,
        options: BuildOptions,
    ) -> Self {
        Self {
            store,
            runtime,
            fetcher,
            context,
            options,
        }
    }

    pub fn build(&mut self, recipe: &Recipe) -> Result<BuildReport> {
        let mut graph = LayerGraph::load(&self.options.cache_index)
            .context("Failed to load build cache")?;
        for reference in &self.options.cache_from {
            let steps = self.store.image_steps(reference)?;
            if steps.is_empty() {
                warn!(image = reference, "no cached steps recorded for image");
            }
            graph.merge(steps);
        }

        let mut args = BuildArgs::new(self.options.build_args.clone());
        let mut stage_results: HashMap<String, StageOutcome> = HashMap::new();
        let total = recipe.total_steps();
        let mut last: Option<StageOutcome> = None;
        let mut offset = 0;

        for (index, stage) in split_stages(&recipe.instructions).into_iter().enumerate() {
            let mut executor = StageExecutor::new(
                self.store,
                self.runtime,
                self.fetcher,
                &mut graph,
                self.context,
                &mut args,
                &stage_results,
                self.options.no_cache,
                self.options.removal,
                recipe.escape_char,
            );
            let outcome = executor.execute(stage, offset, total)?;
            offset += stage.len();

            stage_results.insert(index.to_string(), outcome.clone());
            if let Instruction::From {
                alias: Some(alias), ..
            } = &stage[0].instruction
            {
                stage_results.insert(alias.clone(), outcome.clone());
            }
            last = Some(outcome);
        }

        let outcome = last.expect("parser guarantees at least one FROM");
        if outcome.layers.is_empty() {
            return Err(BuildError::Commit(
                "No image was generated. Is your Dockerfile empty?".to_string(),
            )
            .into());
        }

        // Command-line labels always win over recipe-declared ones.
        let mut config = outcome.config;
        for (key, value) in &self.options.labels {
            config = config.with_label(key, value);
        }

        let recorded = graph.snapshot();
        let image_id = self
            .store
            .commit_image(&config, &outcome.layers, &self.options.tags, &recorded)
            .map_err(|e| BuildError::Commit(e.to_string()))?;
        graph.save().context("Failed to save build cache")?;

        let mut warnings = Vec::new();
        if let Some(warning) = args.unconsumed_warning() {
            warn!("{warning}");
            warnings.push(warning);
        }
        for tag in &self.options.tags {
            info!(%image_id, tag, "tagged image");
        }
        println!("Successfully built {}", &image_id[..12.min(image_id.len())]);

        Ok(BuildReport { image_id, warnings })
    }
}

/// Splits the instruction list into stages, each beginning at a FROM.
fn split_stages(instructions: &[InstructionLine]) -> Vec<&[InstructionLine]> {
    let mut bounds = Vec::new();
    for (i, line) in instructions.iter().enumerate() {
        if matches!(line.instruction, Instruction::From { .. }) {
            bounds.push(i);
        }
    }
    let mut stages = Vec::with_capacity(bounds.len());
    for (n, start) in bounds.iter().enumerate() {
        let end = bounds.get(n + 1).copied().unwrap_or(instructions.len());
        stages.push(&instructions[*start..end]);
    }
    stages
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::tempdir;

    use crate::context::ignore;
    use crate::error::BuildError;
    use crate::runtime::local::LocalRuntime;
    use crate::runtime::{DisabledFetcher, RunOutcome, RunRequest};
    use crate::store::{LayerStore, LocalLayerStore};

    /// Stands in for the chroot runtime: `touch X` produces a one-file diff,
    /// `false` fails with exit 1, anything else succeeds without changes.
    /// Materialization is real.
    struct ScriptedRuntime {
        inner: LocalRuntime,
        work: PathBuf,
    }

    impl ScriptedRuntime {
        fn new(work: PathBuf) -> Self {
            Self {
                inner: LocalRuntime::new(work.clone()),
                work,
            }
        }
    }

    impl RuntimeExecutor for ScriptedRuntime {
        fn run(&self, request: RunRequest) -> Result<RunOutcome> {
            let cmd = request.argv.join(" ");
            if cmd.contains("false") {
                return Ok(RunOutcome {
                    exit_code: 1,
                    diff_dir: None,
                });
            }
            if let Some(rest) = cmd.split("touch ").nth(1) {
                let name = rest.split_whitespace().next().unwrap_or("out");
                let diff = self.work.join(format!("scripted-{name}"));
                fs::create_dir_all(&diff)?;
                fs::write(diff.join(name), "")?;
                return Ok(RunOutcome {
                    exit_code: 0,
                    diff_dir: Some(diff),
                });
            }
            Ok(RunOutcome {
                exit_code: 0,
                diff_dir: None,
            })
        }

        fn materialize(
            &self,
            request: crate::runtime::MaterializeRequest,
        ) -> Result<std::path::PathBuf> {
            self.inner.materialize(request)
        }
    }

    /// Serves one pre-staged file for any URL, standing in for a wired
    /// network fetcher.
    struct StagedFetcher {
        file: PathBuf,
    }

    impl crate::runtime::RemoteFetcher for StagedFetcher {
        fn fetch(&self, _url: &str) -> Result<PathBuf> {
            Ok(self.file.clone())
        }
    }

    fn run_build_with_fetcher(
        recipe_text: &str,
        ctx_dir: &Path,
        store_dir: &Path,
        fetcher: &dyn RemoteFetcher,
        mutate: impl FnOnce(&mut BuildOptions),
    ) -> Result<BuildReport> {
        let rules = ignore::parse("").unwrap();
        let context = BuildContext::prepare(ctx_dir, &rules, None)?;
        let mut store = LocalLayerStore::open(store_dir)?;
        let runtime = ScriptedRuntime::new(store.work_dir());
        let mut options = BuildOptions {
            cache_index: store.cache_index_path(),
            ..BuildOptions::default()
        };
        mutate(&mut options);
        let recipe = Recipe::parse(recipe_text)?;
        Executor::new(&mut store, &runtime, fetcher, &context, options).build(&recipe)
    }

    fn run_build(
        recipe_text: &str,
        ctx_dir: &Path,
        store_dir: &Path,
        mutate: impl FnOnce(&mut BuildOptions),
    ) -> Result<BuildReport> {
        run_build_with_fetcher(recipe_text, ctx_dir, store_dir, &DisabledFetcher, mutate)
    }

    /// Contents of the last layer of the image tagged `tag`.
    fn last_layer_paths(store_dir: &Path, tag: &str) -> Vec<String> {
        let mut store = LocalLayerStore::open(store_dir).unwrap();
        let base = store.resolve_base(tag).unwrap().unwrap();
        let dir = store.layer_dir(base.layers.last().unwrap()).unwrap();
        let mut paths: Vec<String> = walkdir::WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_type().is_dir())
            .map(|e| {
                e.path()
                    .strip_prefix(&dir)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        paths.sort();
        paths
    }

    #[test]
    fn test_split_stages() {
        let recipe =
            Recipe::parse("FROM scratch AS base\nENV a=1\nFROM base\nENV b=2\nENV c=3\n").unwrap();
        let stages = split_stages(&recipe.instructions);
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].len(), 2);
        assert_eq!(stages[1].len(), 3);
    }

    #[test]
    fn test_repeated_build_is_deterministic() {
        let ctx = tempdir().unwrap();
        let store = tempdir().unwrap();
        fs::write(ctx.path().join("app.txt"), "payload").unwrap();
        let recipe = "FROM scratch\nCOPY app.txt /app.txt\nENV mode prod\n";

        let first = run_build(recipe, ctx.path(), store.path(), |_| {}).unwrap();
        let second = run_build(recipe, ctx.path(), store.path(), |_| {}).unwrap();
        assert_eq!(first.image_id, second.image_id);
    }

    #[test]
    fn test_mtime_change_keeps_cache_content_change_busts_it() {
        let ctx = tempdir().unwrap();
        let store = tempdir().unwrap();
        let file = ctx.path().join("data");
        fs::write(&file, "v1").unwrap();
        let recipe = "FROM scratch\nCOPY data /data\n";

        let first = run_build(recipe, ctx.path(), store.path(), |_| {}).unwrap();

        let handle = fs::File::options().append(true).open(&file).unwrap();
        handle
            .set_modified(std::time::SystemTime::UNIX_EPOCH)
            .unwrap();
        drop(handle);
        let second = run_build(recipe, ctx.path(), store.path(), |_| {}).unwrap();
        assert_eq!(first.image_id, second.image_id);

        fs::write(&file, "v2").unwrap();
        let third = run_build(recipe, ctx.path(), store.path(), |_| {}).unwrap();
        assert_ne!(first.image_id, third.image_id);
    }

    #[test]
    fn test_expose_order_is_irrelevant() {
        let ctx = tempdir().unwrap();
        let store = tempdir().unwrap();
        fs::write(ctx.path().join("f"), "x").unwrap();

        let a = run_build(
            "FROM scratch\nCOPY f /f\nEXPOSE 80 99 100\n",
            ctx.path(),
            store.path(),
            |_| {},
        )
        .unwrap();
        let b = run_build(
            "FROM scratch\nCOPY f /f\nEXPOSE 99 80 100\n",
            ctx.path(),
            store.path(),
            |_| {},
        )
        .unwrap();
        assert_eq!(a.image_id, b.image_id);
    }

    #[test]
    fn test_onbuild_fires_in_child_only() {
        let ctx = tempdir().unwrap();
        let store = tempdir().unwrap();
        fs::write(ctx.path().join("f"), "x").unwrap();

        run_build(
            "FROM scratch\nCOPY f /f\nONBUILD RUN touch foobar\n",
            ctx.path(),
            store.path(),
            |o| o.tags = vec!["parent:latest".to_string()],
        )
        .unwrap();

        run_build("FROM parent:latest\nENV stage child\n", ctx.path(), store.path(), |o| {
            o.tags = vec!["child:latest".to_string()]
        })
        .unwrap();
        // The trigger ran: the child gained a layer containing foobar.
        assert_eq!(last_layer_paths(store.path(), "child:latest"), vec!["foobar"]);

        run_build("FROM child:latest\nENV stage grandchild\n", ctx.path(), store.path(), |o| {
            o.tags = vec!["grandchild:latest".to_string()]
        })
        .unwrap();
        let mut store_handle = LocalLayerStore::open(store.path()).unwrap();
        let child = store_handle.resolve_base("child:latest").unwrap().unwrap();
        let grandchild = store_handle
            .resolve_base("grandchild:latest")
            .unwrap()
            .unwrap();
        // No trigger re-fired: the grandchild has exactly the child's layers.
        assert_eq!(grandchild.layers, child.layers);
        assert!(grandchild.config.onbuild.is_empty());
    }

    #[test]
    fn test_unconsumed_build_args_warn_once() {
        let ctx = tempdir().unwrap();
        let store = tempdir().unwrap();
        fs::write(ctx.path().join("f"), "x").unwrap();

        let report = run_build(
            "FROM scratch\nCOPY f /f\nARG used\nENV CONSUMER=$used\n",
            ctx.path(),
            store.path(),
            |o| {
                o.build_args = HashMap::from([
                    ("used".to_string(), "yes".to_string()),
                    ("zed".to_string(), "1".to_string()),
                    ("apple".to_string(), "2".to_string()),
                ]);
            },
        )
        .unwrap();
        assert_eq!(
            report.warnings,
            vec!["One or more build-args [apple, zed] were not consumed".to_string()]
        );
    }

    #[test]
    fn test_copy_destination_semantics() {
        let ctx = tempdir().unwrap();
        let store = tempdir().unwrap();
        fs::write(ctx.path().join("app.conf"), "cfg").unwrap();

        run_build(
            "FROM scratch\nCOPY app.conf /etc/\n",
            ctx.path(),
            store.path(),
            |o| o.tags = vec!["intodir:latest".to_string()],
        )
        .unwrap();
        assert_eq!(
            last_layer_paths(store.path(), "intodir:latest"),
            vec!["etc/app.conf"]
        );

        run_build(
            "FROM scratch\nCOPY app.conf /etc/renamed.conf\n",
            ctx.path(),
            store.path(),
            |o| o.tags = vec!["renamed:latest".to_string()],
        )
        .unwrap();
        assert_eq!(
            last_layer_paths(store.path(), "renamed:latest"),
            vec!["etc/renamed.conf"]
        );
    }

    #[test]
    fn test_symlink_copy_content_change_busts_cache() {
        let ctx = tempdir().unwrap();
        let store = tempdir().unwrap();
        fs::write(ctx.path().join("target"), "v1").unwrap();
        std::os::unix::fs::symlink("target", ctx.path().join("link")).unwrap();
        let recipe = "FROM scratch\nCOPY link /data\n";

        let first = run_build(recipe, ctx.path(), store.path(), |_| {}).unwrap();
        // The copy dereferences the link, so rewriting the target must
        // invalidate the cached step.
        fs::write(ctx.path().join("target"), "v2").unwrap();
        let second = run_build(recipe, ctx.path(), store.path(), |_| {}).unwrap();
        assert_ne!(first.image_id, second.image_id);
    }

    #[test]
    fn test_copy_onto_existing_directory_keeps_basename() {
        let ctx = tempdir().unwrap();
        let store = tempdir().unwrap();
        fs::write(ctx.path().join("seed.conf"), "seed").unwrap();
        fs::write(ctx.path().join("app.conf"), "cfg").unwrap();

        // The first copy creates /etc in the layer chain; the second names
        // /etc without a trailing slash and must still copy into it.
        run_build(
            "FROM scratch\nCOPY seed.conf /etc/\nCOPY app.conf /etc\n",
            ctx.path(),
            store.path(),
            |o| o.tags = vec!["layered:latest".to_string()],
        )
        .unwrap();
        assert_eq!(
            last_layer_paths(store.path(), "layered:latest"),
            vec!["etc/app.conf"]
        );
    }

    #[test]
    fn test_remote_add_source_is_never_extracted() {
        let ctx = tempdir().unwrap();
        let store = tempdir().unwrap();
        let staged = tempdir().unwrap();
        let tar_path = staged.path().join("bundle.tar");
        let mut builder = tar::Builder::new(fs::File::create(&tar_path).unwrap());
        let mut header = tar::Header::new_ustar();
        header.set_size(4);
        header.set_path("payload.txt").unwrap();
        header.set_cksum();
        builder.append(&header, &b"data"[..]).unwrap();
        builder.finish().unwrap();
        drop(builder);

        let fetcher = StagedFetcher { file: tar_path };
        run_build_with_fetcher(
            "FROM scratch\nADD http://example.com/bundle.tar /srv/\n",
            ctx.path(),
            store.path(),
            &fetcher,
            |o| o.tags = vec!["remote:latest".to_string()],
        )
        .unwrap();
        assert_eq!(
            last_layer_paths(store.path(), "remote:latest"),
            vec!["srv/bundle.tar"]
        );
    }

    #[test]
    fn test_add_extracts_tar_but_copies_plain_file() {
        let ctx = tempdir().unwrap();
        let store = tempdir().unwrap();
        let tar_path = ctx.path().join("bundle.tar");
        let mut builder = tar::Builder::new(fs::File::create(&tar_path).unwrap());
        let mut header = tar::Header::new_ustar();
        header.set_size(4);
        header.set_path("payload.txt").unwrap();
        header.set_cksum();
        builder.append(&header, &b"data"[..]).unwrap();
        builder.finish().unwrap();
        drop(builder);
        fs::write(ctx.path().join("plain.txt"), "plain").unwrap();

        run_build("FROM scratch\nADD bundle.tar /\n", ctx.path(), store.path(), |o| {
            o.tags = vec!["extracted:latest".to_string()]
        })
        .unwrap();
        assert_eq!(
            last_layer_paths(store.path(), "extracted:latest"),
            vec!["payload.txt"]
        );

        run_build("FROM scratch\nADD plain.txt /\n", ctx.path(), store.path(), |o| {
            o.tags = vec!["verbatim:latest".to_string()]
        })
        .unwrap();
        assert_eq!(
            last_layer_paths(store.path(), "verbatim:latest"),
            vec!["plain.txt"]
        );
    }

    #[test]
    fn test_missing_copy_source_is_fatal() {
        let ctx = tempdir().unwrap();
        let store = tempdir().unwrap();

        let err = run_build(
            "FROM scratch\nCOPY missing.txt /\n",
            ctx.path(),
            store.path(),
            |_| {},
        )
        .unwrap_err();
        assert!(err.to_string().contains("no such file or directory") || format!("{err:#}").contains("no such file or directory"));

        let err = run_build(
            "FROM scratch\nCOPY *.nothing /\n",
            ctx.path(),
            store.path(),
            |_| {},
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("no source files were specified"));
    }

    #[test]
    fn test_failed_run_preserves_exit_code() {
        let ctx = tempdir().unwrap();
        let store = tempdir().unwrap();

        let err = run_build("FROM scratch\nRUN false\n", ctx.path(), store.path(), |_| {})
            .unwrap_err();
        let build_error = err
            .chain()
            .find_map(|e| e.downcast_ref::<BuildError>())
            .expect("execution error in chain");
        assert_eq!(build_error.exit_code(), 1);
        assert!(format!("{err:#}").contains("returned a non-zero code: 1"));
    }

    #[test]
    fn test_empty_layer_chain_is_fatal() {
        let ctx = tempdir().unwrap();
        let store = tempdir().unwrap();
        let err = run_build("FROM scratch\nENV a=1\n", ctx.path(), store.path(), |_| {})
            .unwrap_err();
        assert!(format!("{err:#}").contains("No image was generated"));
    }

    #[test]
    fn test_multi_stage_alias_and_index() {
        let ctx = tempdir().unwrap();
        let store = tempdir().unwrap();
        fs::write(ctx.path().join("f"), "x").unwrap();

        let report = run_build(
            "FROM scratch AS base\nCOPY f /f\nFROM base\nENV stage final\n",
            ctx.path(),
            store.path(),
            |o| o.tags = vec!["final:latest".to_string()],
        )
        .unwrap();
        let store_handle = LocalLayerStore::open(store.path()).unwrap();
        let final_image = store_handle.resolve_base("final:latest").unwrap().unwrap();
        assert_eq!(final_image.image_id, report.image_id);
        assert_eq!(final_image.layers.len(), 1);
        assert_eq!(final_image.config.get_env("stage"), Some("final"));
    }

    #[test]
    fn test_no_cache_still_records_for_later_builds() {
        let ctx = tempdir().unwrap();
        let store = tempdir().unwrap();
        fs::write(ctx.path().join("f"), "x").unwrap();
        let recipe = "FROM scratch\nCOPY f /f\n";

        run_build(recipe, ctx.path(), store.path(), |o| o.no_cache = true).unwrap();
        let graph =
            LayerGraph::load(&store.path().join("cache.json")).unwrap();
        assert!(!graph.is_empty());
    }
}
