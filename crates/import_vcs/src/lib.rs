//! Source checkout driver.
//!
//! Turns a mirror descriptor into a local, version-pinned working copy. The
//! actual mirroring tool (which clones the upstream repository into a local
//! bare mirror) is an external collaborator; this module only clones *from*
//! that mirror and manages the resulting working copy with the system `git`
//! binary.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// A global cache of the result of `which git`, mirroring the lazy-resolved
/// git binary pattern used elsewhere in this workspace.
pub static GIT: LazyLock<Result<PathBuf, VcsError>> = LazyLock::new(|| {
    which::which("git").map_err(|e| match e {
        which::Error::CannotFindBinaryPath => VcsError::GitNotFound,
        e => VcsError::Which(e),
    })
});

#[derive(Debug, Error)]
#[allow(clippy::enum_variant_names)]
pub enum VcsError {
    #[error("git executable not found; ensure git is installed and on PATH")]
    GitNotFound,
    #[error(transparent)]
    Which(which::Error),
    #[error("`git {args}` failed with status {status}: {stderr}")]
    CommandFailed {
        args: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("could not find a ref for {name} version {version}")]
    RefNotFound { name: String, version: String },
    #[error("{path} exists but is not a git repository root")]
    NotARepository { path: PathBuf },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ref used as the default-branch fallback, matching the source tool's
/// hard-coded `'master'`.
pub const DEFAULT_BRANCH_FALLBACK: &str = "master";

async fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<String, VcsError> {
    let git = GIT.as_ref().map_err(|_| VcsError::GitNotFound)?;

    let mut command = Command::new(git);
    command.args(args);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let output = command.output().await?;
    if !output.status.success() {
        return Err(VcsError::CommandFailed {
            args: args.join(" "),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Replace slashes in a project name with underscores, matching the source
/// tool's derivation of a filesystem-safe mirror subdirectory.
pub fn mirror_subpath(project_name: &str) -> String {
    project_name.replace('/', "_")
}

/// A local, already-cloned working copy.
pub struct Checkout {
    dirname: PathBuf,
}

impl Checkout {
    pub fn dirname(&self) -> &Path {
        &self.dirname
    }

    pub async fn update_remotes(&self) -> Result<(), VcsError> {
        run_git(&["remote", "update"], Some(&self.dirname)).await?;
        Ok(())
    }

    pub async fn has_ref(&self, rev: &str) -> bool {
        run_git(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")], Some(&self.dirname))
            .await
            .is_ok()
    }

    pub async fn checkout(&self, rev: &str) -> Result<(), VcsError> {
        run_git(&["checkout", rev], Some(&self.dirname)).await?;
        Ok(())
    }

    pub async fn resolve_to_commit(&self, rev: &str) -> Result<String, VcsError> {
        run_git(&["rev-parse", &format!("{rev}^{{commit}}")], Some(&self.dirname)).await
    }
}

/// Ensure a local bare mirror exists at `mirror_path`. Invoking the actual
/// mirror-fetch tool is the caller's responsibility (it is an external
/// collaborator, out of scope here); this just validates the result.
pub fn mirror_exists(mirror_path: &Path) -> bool {
    mirror_path.exists()
}

/// The external mirror-fetch tool's calling convention: it is handed a
/// temp file holding the serialised descriptor and a working area to
/// operate in. Modeled as a trait so the loop never needs to know the
/// tool's name, mirroring `_run_lorry`'s subprocess invocation.
#[async_trait]
pub trait MirrorFetcher: Send + Sync {
    async fn fetch(&self, descriptor_path: &Path, working_dir: &Path) -> Result<(), VcsError>;
}

/// Default [`MirrorFetcher`]: invokes the `lorry` binary in pull-only mode.
pub struct LorryMirrorFetcher;

#[async_trait]
impl MirrorFetcher for LorryMirrorFetcher {
    async fn fetch(&self, descriptor_path: &Path, working_dir: &Path) -> Result<(), VcsError> {
        let mut command = Command::new("lorry");
        command.args([
            "--working-area",
            &working_dir.to_string_lossy(),
            "--pull-only",
            "--bundle",
            "never",
            "--tarball",
            "never",
            &descriptor_path.to_string_lossy(),
        ]);
        let output = command.output().await?;
        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                args: "lorry --pull-only".to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Ensure a mirror is up to date: writes `descriptor_json` to a temp file
/// and invokes `fetcher` if the mirror doesn't exist yet, or if
/// `update_existing` is set.
pub async fn ensure_mirror(
    fetcher: &dyn MirrorFetcher,
    descriptor_json: &str,
    working_dir: &Path,
    mirror_path: &Path,
    update_existing: bool,
) -> Result<(), VcsError> {
    let already_mirrored = mirror_exists(mirror_path);
    if !already_mirrored || update_existing {
        let mut temp_file = tempfile::NamedTempFile::new()?;
        temp_file.write_all(descriptor_json.as_bytes())?;
        fetcher.fetch(temp_file.path(), working_dir).await?;
    }
    Ok(())
}

/// Ensure a local working copy at `checkout_path`, cloning from
/// `mirror_path` if it doesn't exist yet, or refreshing remotes if it does.
pub async fn ensure_checkout(mirror_path: &Path, checkout_path: &Path) -> Result<Checkout, VcsError> {
    if checkout_path.exists() {
        if !checkout_path.join(".git").exists() {
            return Err(VcsError::NotARepository {
                path: checkout_path.to_path_buf(),
            });
        }
        let checkout = Checkout {
            dirname: checkout_path.to_path_buf(),
        };
        checkout.update_remotes().await?;
        Ok(checkout)
    } else {
        if let Some(parent) = checkout_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        run_git(
            &[
                "clone",
                &mirror_path.to_string_lossy(),
                &checkout_path.to_string_lossy(),
            ],
            None,
        )
        .await?;
        Ok(Checkout {
            dirname: checkout_path.to_path_buf(),
        })
    }
}

/// Result of pinning a package to a specific version in its checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedVersion {
    /// The version actually in use (equals `version` unless the
    /// default-branch fallback kicked in).
    pub version_in_use: String,
    /// The human-readable ref that was checked out.
    pub named_ref: String,
}

/// Try candidate refs `version`, `v{version}`, `{name}-{version}` in order;
/// check out the first one that exists. Falls back to the default branch if
/// `use_master_if_no_tag` is set and none match.
pub async fn pin_version(
    checkout: &Checkout,
    name: &str,
    version: &str,
    use_master_if_no_tag: bool,
) -> Result<PinnedVersion, VcsError> {
    let candidates = [
        version.to_string(),
        format!("v{version}"),
        format!("{name}-{version}"),
    ];

    for candidate in &candidates {
        if checkout.has_ref(candidate).await {
            checkout.checkout(candidate).await?;
            return Ok(PinnedVersion {
                version_in_use: version.to_string(),
                named_ref: candidate.clone(),
            });
        }
    }

    if use_master_if_no_tag {
        tracing::warn!(name, version, "no matching ref found, using default branch");
        checkout.checkout(DEFAULT_BRANCH_FALLBACK).await?;
        return Ok(PinnedVersion {
            version_in_use: DEFAULT_BRANCH_FALLBACK.to_string(),
            named_ref: DEFAULT_BRANCH_FALLBACK.to_string(),
        });
    }

    Err(VcsError::RefNotFound {
        name: name.to_string(),
        version: version.to_string(),
    })
}
