//! Command-line front-end for the import tool.
//!
//! Parses the goal package triple and importer configuration, wires up the
//! [`import_loop::ImportLoop`], and drives the aggregate stratum emitter
//! once the loop has drained.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use import_extensions::{ExtensionImporter, ProcessExtensionRunner};
use import_loop::{ImportConfig, ImportLoop};
use import_vcs::LorryMirrorFetcher;
use miette::IntoDiagnostic;
use tracing::level_filters::LevelFilter;

#[derive(Parser, Debug)]
#[command(
    name = "import",
    version,
    about = "Import a foreign-ecosystem package into version-pinned, dependency-ordered build recipes"
)]
pub struct Args {
    /// Ecosystem kind of the goal package, e.g. "pypi", "rubygems", "npm".
    pub goal_kind: String,
    /// Name of the goal package as known to its ecosystem.
    pub goal_name: String,
    /// Version of the goal package to import.
    pub goal_version: String,

    /// Enable an importer for an ecosystem kind. May be repeated to chase
    /// dependencies across more than one ecosystem in the same run.
    #[arg(long = "importer", value_name = "KIND")]
    pub importers: Vec<String>,

    /// An extra argument to pass to one importer's tools, formatted
    /// `kind=value`. May be repeated, including more than once for the same
    /// kind.
    #[arg(long = "extra-arg", value_name = "KIND=VALUE")]
    pub extra_args: Vec<String>,

    #[command(flatten)]
    pub directories: DirectoryOptions,

    /// Re-fetch mirrors, re-checkout sources, and regenerate recipes even
    /// when already present.
    #[arg(long)]
    pub update_existing: bool,

    /// Reference sources by their local checkout path instead of the
    /// upstream URL in generated recipes.
    #[arg(long)]
    pub use_local_sources: bool,

    /// Fall back to the default branch when no ref matches the requested
    /// version, instead of failing the package.
    #[arg(long)]
    pub use_master_if_no_tag: bool,

    /// Regenerate the aggregate stratum even if one already exists on disk.
    #[arg(long)]
    pub force_stratum_generation: bool,

    /// Increase logging verbosity (-v for warnings, -vv for info, -vvv for
    /// debug, -vvvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Decrease logging verbosity (quiet mode).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub quiet: u8,
}

#[derive(clap::Args, Debug)]
pub struct DirectoryOptions {
    /// Directory holding mirror descriptor (`.lorry`) files.
    #[arg(long, default_value = "lorries")]
    pub descriptor_dir: PathBuf,
    /// Directory holding recipes and dependency caches.
    #[arg(long, default_value = "definitions")]
    pub recipe_dir: PathBuf,
    /// Working area the mirror-fetch tool operates in.
    #[arg(long, default_value = "lorry-work")]
    pub mirror_working_dir: PathBuf,
    /// Directory version-pinned working copies are checked out into.
    #[arg(long, default_value = "checkouts")]
    pub checkouts_dir: PathBuf,
    /// Directory holding the `<kind>.to_lorry`/`to_chunk`/`find_deps` tools.
    #[arg(long, default_value = "exts")]
    pub extensions_dir: PathBuf,
}

impl Args {
    fn log_level_filter(&self) -> LevelFilter {
        match (self.quiet, self.verbose) {
            (q, _) if q > 0 => LevelFilter::OFF,
            (_, 0) => LevelFilter::ERROR,
            (_, 1) => LevelFilter::WARN,
            (_, 2) => LevelFilter::INFO,
            (_, 3) => LevelFilter::DEBUG,
            (_, _) => LevelFilter::TRACE,
        }
    }

    fn to_config(&self) -> ImportConfig {
        ImportConfig {
            descriptor_dir: self.directories.descriptor_dir.clone(),
            recipe_dir: self.directories.recipe_dir.clone(),
            mirror_working_dir: self.directories.mirror_working_dir.clone(),
            checkouts_dir: self.directories.checkouts_dir.clone(),
            extensions_dir: self.directories.extensions_dir.clone(),
            update_existing: self.update_existing,
            use_local_sources: self.use_local_sources,
            use_master_if_no_tag: self.use_master_if_no_tag,
            force_stratum_generation: self.force_stratum_generation,
        }
    }

    fn extra_args_by_kind(&self) -> HashMap<String, Vec<String>> {
        let mut by_kind: HashMap<String, Vec<String>> = HashMap::new();
        for entry in &self.extra_args {
            if let Some((kind, value)) = entry.split_once('=') {
                by_kind.entry(kind.to_string()).or_default().push(value.to_string());
            } else {
                tracing::warn!(entry, "ignoring malformed --extra-arg, expected KIND=VALUE");
            }
        }
        by_kind
    }
}

/// Set up the `tracing` subscriber from the CLI's verbosity flags, with
/// `RUST_LOG` honored only when no `-v`/`-q` flag was given explicitly.
pub fn setup_logging(args: &Args) -> miette::Result<()> {
    use tracing_subscriber::{EnvFilter, prelude::*};

    let level = args.log_level_filter();
    let cli_verbosity_set = args.verbose > 0 || args.quiet > 0;

    let env_filter = if cli_verbosity_set {
        EnvFilter::builder()
            .with_default_directive(level.into())
            .parse(format!("import_loop={level},import_cli={level},import_vcs={level}"))
            .into_diagnostic()?
    } else {
        let rust_log = std::env::var("RUST_LOG").unwrap_or_default();
        let base = format!("import_loop={level},import_cli={level},import_vcs={level}");
        let directives = if rust_log.is_empty() {
            base
        } else {
            format!("{base},{rust_log}")
        };
        EnvFilter::builder()
            .with_default_directive(level.into())
            .parse(&directives)
            .into_diagnostic()?
    };

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(level >= LevelFilter::INFO).without_time();

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();

    Ok(())
}

/// Run the import end to end: build the loop, enable the requested
/// importers, drain the queue, and (unless skipped) emit the aggregate
/// stratum. Returns the number of packages that failed to import.
pub async fn run(args: Args) -> miette::Result<usize> {
    let config = args.to_config();
    let extra_args_by_kind = args.extra_args_by_kind();

    let mut import_loop = ImportLoop::new(
        args.goal_kind.clone(),
        args.goal_name.clone(),
        args.goal_version.clone(),
        config.clone(),
        Arc::new(LorryMirrorFetcher),
    )
    .into_diagnostic()?;

    for kind in &args.importers {
        let extra_args = extra_args_by_kind.get(kind).cloned().unwrap_or_default();
        let runner = Arc::new(ProcessExtensionRunner::new(config.extensions_dir.clone()));
        import_loop.enable_importer(Arc::new(ExtensionImporter::new(kind.clone(), extra_args, runner)));
    }

    let outcome = import_loop.run().await.into_diagnostic()?;
    let error_count = outcome.errors.len();

    if import_emitter::should_emit(
        &config.recipe_dir,
        &outcome.goal_name,
        config.update_existing,
        config.force_stratum_generation,
    ) {
        if config.force_stratum_generation {
            import_emitter::emit_stratum(
                &outcome.arena,
                &outcome.graph,
                &outcome.recipes,
                &outcome.goal_name,
                &outcome.enabled_kinds,
                true,
            )
            .await
            .into_diagnostic()?;
        } else if error_count > 0 {
            tracing::warn!(error_count, "skipping stratum generation: some packages failed to import");
        } else {
            import_emitter::emit_stratum(
                &outcome.arena,
                &outcome.graph,
                &outcome.recipes,
                &outcome.goal_name,
                &outcome.enabled_kinds,
                false,
            )
            .await
            .into_diagnostic()?;
        }
    }

    for err in outcome.errors.values() {
        tracing::error!("{err}");
    }

    Ok(error_count)
}
