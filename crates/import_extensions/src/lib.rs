//! Pluggable per-ecosystem extension dispatch.
//!
//! Each enabled ecosystem (`kind`) supplies three executables,
//! `<kind>.to_lorry`, `<kind>.to_chunk`, `<kind>.find_deps`, invoked with a
//! fixed argument shape and expected to print their result on standard
//! output. [`ExtensionRunner`] is the low-level process-spawning seam;
//! [`Importer`] is the per-kind façade the import loop actually calls,
//! built on top of it so tests can substitute an in-process fake without
//! spawning anything real.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("importer for {kind} was not enabled")]
    NotEnabled { kind: String },
    #[error("extension {tool} failed with code {code:?}: {stderr}")]
    Failed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("io error spawning {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

/// Low-level seam: run a named tool with arguments and a working directory,
/// returning its captured standard output.
#[async_trait]
pub trait ExtensionRunner: Send + Sync {
    async fn run(
        &self,
        tool_name: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<String, ExtensionError>;
}

/// Spawns extensions as real subprocesses found in a known directory.
pub struct ProcessExtensionRunner {
    extensions_dir: PathBuf,
}

impl ProcessExtensionRunner {
    pub fn new(extensions_dir: impl Into<PathBuf>) -> Self {
        Self {
            extensions_dir: extensions_dir.into(),
        }
    }
}

#[async_trait]
impl ExtensionRunner for ProcessExtensionRunner {
    async fn run(
        &self,
        tool_name: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<String, ExtensionError> {
        let extension_path = self.extensions_dir.join(tool_name);

        tracing::debug!(
            tool = tool_name,
            ?args,
            cwd = ?cwd,
            "running extension"
        );

        let mut command = Command::new(&extension_path);
        command.args(args);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command.output().await.map_err(|source| ExtensionError::Io {
            tool: tool_name.to_string(),
            source,
        })?;

        let logger = tracing::debug_span!("extension", tool = tool_name);
        let _enter = logger.enter();
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            tracing::debug!("{line}");
        }

        if !output.status.success() {
            return Err(ExtensionError::Failed {
                tool: tool_name.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// The per-kind façade the import loop calls. Backed by an
/// [`ExtensionRunner`] plus the extra arguments configured when the kind was
/// enabled.
#[async_trait]
pub trait Importer: Send + Sync {
    fn kind(&self) -> &str;
    async fn to_mirror(&self, name: &str) -> Result<String, ExtensionError>;
    async fn to_recipe(
        &self,
        checkout_dir: &Path,
        name: &str,
        version: Option<&str>,
    ) -> Result<String, ExtensionError>;
    async fn find_deps(
        &self,
        checkout_dir: &Path,
        name: &str,
        version: Option<&str>,
    ) -> Result<String, ExtensionError>;
}

/// Default [`Importer`] implementation: dispatches to the three named tools
/// via an [`ExtensionRunner`].
pub struct ExtensionImporter {
    kind: String,
    extra_args: Vec<String>,
    runner: Arc<dyn ExtensionRunner>,
}

impl ExtensionImporter {
    pub fn new(kind: impl Into<String>, extra_args: Vec<String>, runner: Arc<dyn ExtensionRunner>) -> Self {
        Self {
            kind: kind.into(),
            extra_args,
            runner,
        }
    }

    fn recipe_or_deps_args(&self, checkout_dir: &Path, name: &str, version: Option<&str>) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.push(checkout_dir.to_string_lossy().into_owned());
        args.push(name.to_string());
        if let Some(version) = version {
            args.push(version.to_string());
        }
        args
    }
}

#[async_trait]
impl Importer for ExtensionImporter {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn to_mirror(&self, name: &str) -> Result<String, ExtensionError> {
        let mut args = self.extra_args.clone();
        args.push(name.to_string());
        self.runner
            .run(&format!("{}.to_lorry", self.kind), &args, None)
            .await
    }

    async fn to_recipe(
        &self,
        checkout_dir: &Path,
        name: &str,
        version: Option<&str>,
    ) -> Result<String, ExtensionError> {
        let args = self.recipe_or_deps_args(checkout_dir, name, version);
        self.runner
            .run(&format!("{}.to_chunk", self.kind), &args, None)
            .await
    }

    async fn find_deps(
        &self,
        checkout_dir: &Path,
        name: &str,
        version: Option<&str>,
    ) -> Result<String, ExtensionError> {
        let args = self.recipe_or_deps_args(checkout_dir, name, version);
        self.runner
            .run(&format!("{}.find_deps", self.kind), &args, None)
            .await
    }
}
