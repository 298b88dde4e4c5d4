use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::os::unix::fs::{MetadataExt, PermissionsExt, symlink};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use nix::unistd::{Gid, Uid, chdir, chroot, setgid, setgroups, setuid};
use rand::{Rng, distr::Alphanumeric};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::build::user::UserSpec;
use crate::context::safejoin::safe_join;
use crate::error::EXIT_COULD_NOT_START;
use crate::runtime::{MaterializeRequest, RunOutcome, RunRequest, RuntimeExecutor};

/// Runs build commands in a chroot over a composed rootfs and produces diff
/// directories by snapshotting file metadata around the command.
#[derive(Debug)]
pub struct LocalRuntime {
    work_dir: PathBuf,
}

impl LocalRuntime {
    pub fn new(work_dir: PathBuf) -> Self {
        Self { work_dir }
    }

    fn sandbox(&self, prefix: &str) -> Result<PathBuf> {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        let dir = self.work_dir.join(format!("{prefix}-{suffix}"));
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create work directory {}", dir.display()))?;
        Ok(dir)
    }

    fn compose_rootfs(&self, rootfs: &Path, layers: &[PathBuf]) -> Result<()> {
        fs::create_dir_all(rootfs)
            .with_context(|| format!("Failed to create rootfs {}", rootfs.display()))?;
        for layer in layers {
            copy_tree(layer, rootfs)
                .with_context(|| format!("Failed to apply layer {}", layer.display()))?;
        }
        Ok(())
    }
}

impl RuntimeExecutor for LocalRuntime {
    fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        let sandbox = self.sandbox("run")?;
        let rootfs = sandbox.join("rootfs");
        self.compose_rootfs(&rootfs, &request.rootfs_layers)?;

        let workdir = if request.workdir.is_empty() {
            "/".to_string()
        } else {
            request.workdir.clone()
        };
        let inner = rootfs.join(workdir.trim_start_matches('/'));
        fs::create_dir_all(&inner)
            .with_context(|| format!("Failed to create workdir {}", inner.display()))?;

        let ids = match &request.user {
            Some(spec) => Some(resolve_user(&rootfs, spec)?),
            None => None,
        };

        let before = snapshot_tree(&rootfs)?;

        let mut command = Command::new(&request.argv[0]);
        command.args(&request.argv[1..]).env_clear();
        for entry in &request.env {
            if let Some((k, v)) = entry.split_once('=') {
                command.env(k, v);
            }
        }
        let jail = rootfs.clone();
        let wd = PathBuf::from(&workdir);
        // Converted ahead of the fork; pre_exec must not allocate.
        let creds = ids.map(|(uid, gid, sup)| {
            let sup: Vec<Gid> = sup.into_iter().map(Gid::from_raw).collect();
            (Uid::from_raw(uid), Gid::from_raw(gid), sup)
        });
        unsafe {
            command.pre_exec(move || {
                chroot(&jail).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                chdir(&wd).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                if let Some((uid, gid, sup)) = &creds {
                    setgroups(sup).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                    setgid(*gid).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                    setuid(*uid).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                }
                Ok(())
            });
        }

        let exit_code = match command.status() {
            Ok(status) => status.code().unwrap_or(EXIT_COULD_NOT_START),
            Err(err) => {
                warn!(argv = ?request.argv, %err, "command could not start");
                EXIT_COULD_NOT_START
            }
        };

        let diff_dir = if exit_code == 0 {
            let diff = sandbox.join("diff");
            let changed = collect_diff(&rootfs, &before, &diff)?;
            if changed { Some(diff) } else { None }
        } else {
            None
        };

        if request.removal.should_remove(exit_code == 0) {
            if let Err(err) = fs::remove_dir_all(&rootfs) {
                warn!(%err, "failed to remove rootfs {}", rootfs.display());
            }
        }

        Ok(RunOutcome {
            exit_code,
            diff_dir,
        })
    }

    fn materialize(&self, request: MaterializeRequest) -> Result<PathBuf> {
        let diff = self.sandbox("diff")?;
        for item in &request.items {
            let Some(target) = safe_join(&diff, &item.dest)? else {
                debug!(dest = %item.dest, "dropping write outside destination root");
                continue;
            };
            let meta = fs::metadata(&item.src)
                .with_context(|| format!("Failed to stat {}", item.src.display()))?;
            if meta.is_dir() {
                copy_tree(&item.src, &target)?;
            } else if item.extract && sniff_archive(&item.src)?.is_some() {
                extract_archive(&item.src, &target)?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                fs::copy(&item.src, &target).with_context(|| {
                    format!(
                        "Failed to copy {} to {}",
                        item.src.display(),
                        target.display()
                    )
                })?;
                fs::set_permissions(&target, meta.permissions())?;
            }
            if let Some((uid, gid)) = request.chown {
                chown_tree(&target, uid, gid);
            }
        }
        Ok(diff)
    }
}

/// Resolves a USER value against the rootfs passwd and group databases.
/// Numeric ids pass straight through. Returns (uid, primary gid,
/// supplementary gids including the primary).
fn resolve_user(rootfs: &Path, spec: &UserSpec) -> Result<(u32, u32, Vec<u32>)> {
    if let Some((uid, gid)) = spec.numeric() {
        let gid = gid.unwrap_or(uid);
        return Ok((uid, gid, vec![gid]));
    }
    let passwd = fs::read_to_string(rootfs.join("etc/passwd")).unwrap_or_default();
    let groups = fs::read_to_string(rootfs.join("etc/group")).unwrap_or_default();
    let (uid, login_gid) = lookup_passwd(&passwd, &spec.user)
        .ok_or_else(|| anyhow::anyhow!("unable to find user {}", spec.user))?;
    let gid = match &spec.group {
        None => login_gid,
        Some(group) => {
            if let Ok(gid) = group.parse() {
                gid
            } else {
                lookup_group(&groups, group)
                    .ok_or_else(|| anyhow::anyhow!("unable to find group {group}"))?
            }
        }
    };
    Ok((uid, gid, supplementary_groups(&groups, &spec.user, gid)))
}

fn lookup_passwd(passwd: &str, name: &str) -> Option<(u32, u32)> {
    for line in passwd.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 4 && fields[0] == name {
            return Some((fields[2].parse().ok()?, fields[3].parse().ok()?));
        }
    }
    None
}

fn lookup_group(groups: &str, name: &str) -> Option<u32> {
    for line in groups.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 3 && fields[0] == name {
            return fields[2].parse().ok();
        }
    }
    None
}

/// The primary group plus every group whose member list names the user.
fn supplementary_groups(groups: &str, user: &str, primary: u32) -> Vec<u32> {
    let mut out = vec![primary];
    for line in groups.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 4 && fields[3].split(',').any(|m| m == user) {
            if let Ok(gid) = fields[2].parse() {
                if !out.contains(&gid) {
                    out.push(gid);
                }
            }
        }
    }
    out
}

#[derive(Debug, PartialEq, Eq)]
struct FileState {
    len: u64,
    mode: u32,
    mtime: Option<SystemTime>,
    is_dir: bool,
}

fn snapshot_tree(root: &Path) -> Result<HashMap<PathBuf, FileState>> {
    let mut states = HashMap::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths under root")
            .to_path_buf();
        if rel.as_os_str().is_empty() {
            continue;
        }
        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        states.insert(
            rel,
            FileState {
                len: meta.len(),
                mode: meta.mode(),
                mtime: meta.modified().ok(),
                is_dir: meta.is_dir(),
            },
        );
    }
    Ok(states)
}

/// Copies every path that is new or changed since `before` into `diff`,
/// preserving relative layout. Returns whether anything changed. Deletions
/// are not represented; whiteout support would go here.
fn collect_diff(
    root: &Path,
    before: &HashMap<PathBuf, FileState>,
    diff: &Path,
) -> Result<bool> {
    let after = snapshot_tree(root)?;
    let mut changed = false;
    for (rel, state) in &after {
        if before.get(rel) == Some(state) {
            continue;
        }
        if state.is_dir {
            fs::create_dir_all(diff.join(rel))?;
            changed = true;
            continue;
        }
        let src = root.join(rel);
        let dst = diff.join(rel);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        let meta = fs::symlink_metadata(&src)?;
        if meta.file_type().is_symlink() {
            symlink(fs::read_link(&src)?, &dst)?;
        } else {
            fs::copy(&src, &dst)
                .with_context(|| format!("Failed to copy changed file {}", src.display()))?;
            fs::set_permissions(&dst, meta.permissions())?;
        }
        changed = true;
    }
    Ok(changed)
}

/// Copies `src` into `dst`, preserving symlinks, permissions, and (best
/// effort) ownership. Later sources overwrite earlier ones.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under root");
        let target = dst.join(rel);
        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        if meta.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if meta.file_type().is_symlink() {
            if target.exists() || fs::symlink_metadata(&target).is_ok() {
                fs::remove_file(&target).ok();
            }
            symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "Failed to copy {} to {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
            fs::set_permissions(&target, meta.permissions())?;
        }
        if !meta.file_type().is_symlink() {
            let _ = std::os::unix::fs::chown(&target, Some(meta.uid()), Some(meta.gid()));
        }
    }
    Ok(())
}

fn chown_tree(path: &Path, uid: u32, gid: u32) {
    for entry in WalkDir::new(path).follow_links(false).into_iter().flatten() {
        let _ = std::os::unix::fs::chown(entry.path(), Some(uid), Some(gid));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
}

/// Identifies archives ADD should unpack: gzip by magic bytes, plain tar by
/// the ustar magic. Anything else is copied as an ordinary file.
pub fn sniff_archive(path: &Path) -> Result<Option<ArchiveKind>> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut magic = [0u8; 2];
    if file.read(&mut magic)? == 2 && magic == [0x1f, 0x8b] {
        return Ok(Some(ArchiveKind::TarGz));
    }
    let mut ustar = [0u8; 5];
    if file.seek(SeekFrom::Start(257)).is_ok() && file.read(&mut ustar)? == 5 && &ustar == b"ustar"
    {
        return Ok(Some(ArchiveKind::Tar));
    }
    Ok(None)
}

/// Unpacks a tar or tar.gz into `dest`, vetting every member path so archive
/// entries cannot write outside the destination.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let kind = sniff_archive(archive)?;
    let file =
        File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let reader = BufReader::new(file);
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    match kind {
        Some(ArchiveKind::TarGz) => unpack(tar::Archive::new(GzDecoder::new(reader)), dest),
        Some(ArchiveKind::Tar) => unpack(tar::Archive::new(reader), dest),
        None => bail!("{} is not a recognized archive", archive.display()),
    }
}

fn unpack<R: Read>(mut archive: tar::Archive<R>, dest: &Path) -> Result<()> {
    archive.set_preserve_permissions(true);
    for entry in archive.entries().context("Failed to read archive")? {
        let mut entry = entry.context("Failed to read archive entry")?;
        let rel = entry.path()?.to_string_lossy().into_owned();
        let Some(target) = safe_join(dest, &rel)? else {
            debug!(member = %rel, "dropping archive member escaping destination");
            continue;
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .with_context(|| format!("Failed to unpack {rel}"))?;
    }
    Ok(())
}
