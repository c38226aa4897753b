//! The import loop: the orchestrator that drives dependency discovery for
//! a goal package to a fixed point.
//!
//! For each dequeued package it resolves a mirror descriptor, materialises
//! a version-pinned checkout, generates or reuses a build recipe, asks an
//! extension for the package's direct dependencies, and enqueues those
//! dependencies — applying role inheritance (a runtime dependency of a
//! build dependency is itself a build dependency) as it goes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use import_extensions::{ExtensionError, Importer};
use import_graph::ProcessedGraph;
use import_mirror::{DescriptorEntry, DescriptorFile, MirrorDescriptorSet, MirrorError};
use import_package::{DependencyLists, Package, PackageArena, PackageId};
use import_recipe::{Recipe, RecipeError, RecipeSet};
use import_vcs::{Checkout, MirrorFetcher, VcsError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Directory layout and behavioural flags for one import run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Where mirror descriptor (`.lorry`) files live.
    pub descriptor_dir: PathBuf,
    /// Where recipes (`.morph`) and dependency caches are read from and
    /// written to.
    pub recipe_dir: PathBuf,
    /// Working area the mirror-fetch tool operates in.
    pub mirror_working_dir: PathBuf,
    /// Where version-pinned working copies are checked out.
    pub checkouts_dir: PathBuf,
    /// Directory that holds the `<kind>.to_lorry`/`to_chunk`/`find_deps`
    /// executables.
    pub extensions_dir: PathBuf,
    #[serde(default)]
    pub update_existing: bool,
    #[serde(default)]
    pub use_local_sources: bool,
    #[serde(default)]
    pub use_master_if_no_tag: bool,
    #[serde(default)]
    pub force_stratum_generation: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            descriptor_dir: PathBuf::from("lorries"),
            recipe_dir: PathBuf::from("definitions"),
            mirror_working_dir: PathBuf::from("lorry-work"),
            checkouts_dir: PathBuf::from("checkouts"),
            extensions_dir: PathBuf::from("exts"),
            update_existing: false,
            use_local_sources: false,
            use_master_if_no_tag: false,
            force_stratum_generation: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("importer for kind {kind} was not enabled")]
    ImporterNotEnabled { kind: String },
    #[error(transparent)]
    Extension(#[from] ExtensionError),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    #[error(transparent)]
    Recipe(#[from] RecipeError),
    #[error(transparent)]
    Vcs(#[from] VcsError),
    #[error("invalid descriptor output for {name}: {reason}")]
    InvalidDescriptor { name: String, reason: String },
    #[error("invalid recipe output for {name}: {reason}")]
    InvalidRecipe { name: String, reason: String },
    #[error("invalid dependency output for {name}: {reason}")]
    InvalidDependencies { name: String, reason: String },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything the aggregate-recipe emitter needs once the queue has
/// drained.
pub struct ImportOutcome {
    pub arena: PackageArena,
    pub graph: ProcessedGraph,
    pub errors: HashMap<PackageId, LoopError>,
    pub recipes: RecipeSet,
    pub goal_name: String,
    /// Every ecosystem kind enabled for this run, in the order
    /// `enable_importer` was called. The emitter unions build-dependencies
    /// over all of these, not just the kind of the chunk being emitted.
    pub enabled_kinds: Vec<String>,
}

pub struct ImportLoop {
    goal_kind: String,
    goal_name: String,
    goal_version: String,
    config: ImportConfig,
    importers: HashMap<String, Arc<dyn Importer>>,
    enabled_kinds: Vec<String>,
    mirror_fetcher: Arc<dyn MirrorFetcher>,
    descriptors: MirrorDescriptorSet,
    recipes: RecipeSet,
    arena: PackageArena,
    queue: Vec<PackageId>,
    graph: ProcessedGraph,
    errors: HashMap<PackageId, LoopError>,
}

impl ImportLoop {
    pub fn new(
        goal_kind: impl Into<String>,
        goal_name: impl Into<String>,
        goal_version: impl Into<String>,
        config: ImportConfig,
        mirror_fetcher: Arc<dyn MirrorFetcher>,
    ) -> Result<Self, LoopError> {
        let descriptors = MirrorDescriptorSet::load(&config.descriptor_dir)?;
        let recipes = RecipeSet::load_all(&config.recipe_dir)?;
        Ok(Self {
            goal_kind: goal_kind.into(),
            goal_name: goal_name.into(),
            goal_version: goal_version.into(),
            config,
            importers: HashMap::new(),
            enabled_kinds: Vec::new(),
            mirror_fetcher,
            descriptors,
            recipes,
            arena: PackageArena::new(),
            queue: Vec::new(),
            graph: ProcessedGraph::new(),
            errors: HashMap::new(),
        })
    }

    /// Enable an importer for one ecosystem kind. Panics if called twice
    /// for the same kind, matching the source tool's `assert kind not in
    /// self.importers`.
    pub fn enable_importer(&mut self, importer: Arc<dyn Importer>) {
        let kind = importer.kind().to_string();
        assert!(
            !self.importers.contains_key(&kind),
            "importer for {kind} already enabled"
        );
        self.enabled_kinds.push(kind.clone());
        self.importers.insert(kind, importer);
    }

    /// Process the goal package and all of its dependencies to a fixed
    /// point. Per-package failures are recorded in the returned outcome's
    /// error map rather than aborting the run.
    pub async fn run(mut self) -> Result<ImportOutcome, LoopError> {
        tracing::info!(
            kind = self.goal_kind,
            name = self.goal_name,
            version = self.goal_version,
            "import started"
        );
        if !self.config.update_existing {
            tracing::info!("not updating existing checkouts or definitions");
        }

        let chunk_dir = self.config.recipe_dir.join("strata").join(&self.goal_name);
        std::fs::create_dir_all(&chunk_dir)?;

        let goal = Package::new(
            self.goal_kind.clone(),
            self.goal_name.clone(),
            self.goal_version.clone(),
        );
        let goal_id = self.arena.insert(goal);
        self.queue.push(goal_id);

        while let Some(current) = self.queue.pop() {
            let label = self
                .arena
                .get(current)
                .map(|p| p.label())
                .unwrap_or_default();
            tracing::info!(package = label, "processing package");

            match self.process_package(current).await {
                Ok(()) => {
                    self.graph.add_node(current);
                    self.enqueue_dependencies(current);
                }
                Err(err) => {
                    tracing::error!(package = label, error = %err, "import failed");
                    self.graph.add_node(current);
                    self.errors.insert(current, err);
                }
            }
        }

        tracing::info!(
            kind = self.goal_kind,
            name = self.goal_name,
            errors = self.errors.len(),
            "import ended"
        );

        Ok(ImportOutcome {
            arena: self.arena,
            graph: self.graph,
            errors: self.errors,
            recipes: self.recipes,
            goal_name: self.goal_name,
            enabled_kinds: self.enabled_kinds,
        })
    }

    async fn process_package(&mut self, id: PackageId) -> Result<(), LoopError> {
        let (kind, name, version) = {
            let package = self.arena.get(id).expect("valid package id");
            (package.kind.clone(), package.name.clone(), package.version.clone())
        };

        let importer = self
            .importers
            .get(&kind)
            .cloned()
            .ok_or_else(|| LoopError::ImporterNotEnabled { kind: kind.clone() })?;

        let (project_name, descriptor) = self.find_or_create_descriptor(importer.as_ref(), &kind, &name).await?;

        let subpath = import_vcs::mirror_subpath(&project_name);
        let mirror_path = self.config.mirror_working_dir.join(&subpath).join("git");
        let checkout_path = self.config.checkouts_dir.join(&subpath);

        let mut descriptor_file: DescriptorFile = BTreeMap::new();
        descriptor_file.insert(project_name.clone(), descriptor);
        let descriptor_json = serde_json::to_string(&descriptor_file)?;

        import_vcs::ensure_mirror(
            self.mirror_fetcher.as_ref(),
            &descriptor_json,
            &self.config.mirror_working_dir,
            &mirror_path,
            self.config.update_existing,
        )
        .await?;

        let checkout = import_vcs::ensure_checkout(&mirror_path, &checkout_path).await?;

        let pinned = import_vcs::pin_version(&checkout, &name, &version, self.config.use_master_if_no_tag).await?;

        if let Some(package) = self.arena.get_mut(id) {
            package.version_in_use = pinned.version_in_use.clone();
        }

        let recipe_path = PathBuf::from("strata")
            .join(&self.goal_name)
            .join(format!("{name}-{}.morph", pinned.version_in_use));
        let commit_id = checkout.resolve_to_commit(&pinned.named_ref).await?;

        let repo_url = if self.config.use_local_sources {
            format!("file://{}", checkout.dirname().display())
        } else {
            format!("upstream:{project_name}")
        };

        let version_for_tool = if pinned.version_in_use == import_vcs::DEFAULT_BRANCH_FALLBACK {
            None
        } else {
            Some(pinned.version_in_use.as_str())
        };

        let mut recipe = self
            .find_or_generate_recipe(
                importer.as_ref(),
                &checkout,
                &kind,
                &name,
                version_for_tool,
                &recipe_path,
                &repo_url,
                &commit_id,
            )
            .await?;

        recipe.repo_url = Some(repo_url);
        recipe.commit_id = Some(commit_id);
        recipe.named_ref = Some(pinned.named_ref.clone());
        self.recipes.save(recipe_path.clone(), recipe).await?;

        if let Some(package) = self.arena.get_mut(id) {
            package.recipe_path = Some(recipe_path);
        }

        let deps_path = PathBuf::from("strata")
            .join(&self.goal_name)
            .join(format!("{name}-{}.foreign-dependencies", pinned.version_in_use));
        let dependencies = self
            .find_or_generate_dependencies(importer.as_ref(), &checkout, &name, version_for_tool, &deps_path)
            .await?;

        if let Some(package) = self.arena.get_mut(id) {
            package.direct_dependencies = dependencies;
        }

        Ok(())
    }

    async fn find_or_create_descriptor(
        &mut self,
        importer: &dyn Importer,
        kind: &str,
        name: &str,
    ) -> Result<(String, DescriptorEntry), LoopError> {
        if let Some((project_name, entry)) = self.descriptors.find_by_product(kind, name) {
            tracing::info!(name, project_name, "found existing descriptor");
            return Ok((project_name.to_string(), entry.clone()));
        }

        tracing::info!(kind, name, "generating descriptor");
        let text = importer.to_mirror(name).await?;
        let file: DescriptorFile = serde_json::from_str(&text).map_err(|e| LoopError::InvalidDescriptor {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        if file.len() != 1 {
            return Err(LoopError::InvalidDescriptor {
                name: name.to_string(),
                reason: format!("expected exactly one entry, got {}", file.len()),
            });
        }
        let (project_name, entry) = file.into_iter().next().expect("checked len == 1");

        let file_stem = project_name.split('/').next().unwrap_or_default().to_string();
        if file_stem.is_empty() {
            return Err(LoopError::InvalidDescriptor {
                name: name.to_string(),
                reason: "empty project name".to_string(),
            });
        }

        self.descriptors.add(&file_stem, &project_name, entry.clone()).await?;

        Ok((project_name, entry))
    }

    #[allow(clippy::too_many_arguments)]
    async fn find_or_generate_recipe(
        &mut self,
        importer: &dyn Importer,
        checkout: &Checkout,
        kind: &str,
        name: &str,
        version: Option<&str>,
        path: &Path,
        repo_url: &str,
        commit_id: &str,
    ) -> Result<Recipe, LoopError> {
        if self.config.update_existing {
            return self.generate_recipe(importer, checkout, kind, name, version).await;
        }

        if let Some(existing) = self.recipes.get(Some(repo_url), Some(commit_id), path) {
            return Ok(existing.clone());
        }

        tracing::debug!(repo_url, commit_id, path = %path.display(), "no annotated recipe found");

        if let Some(existing) = self.recipes.get(None, None, path) {
            return Ok(existing.clone());
        }

        self.generate_recipe(importer, checkout, kind, name, version).await
    }

    async fn generate_recipe(
        &mut self,
        importer: &dyn Importer,
        checkout: &Checkout,
        kind: &str,
        name: &str,
        version: Option<&str>,
    ) -> Result<Recipe, LoopError> {
        tracing::info!(kind, name, "calling to_chunk extension");
        let text = importer.to_recipe(checkout.dirname(), name, version).await?;
        let mut recipe: Recipe = serde_json::from_str(&text).map_err(|e| LoopError::InvalidRecipe {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        recipe.name = name.to_string();
        recipe.kind = kind.to_string();
        Ok(recipe)
    }

    async fn find_or_generate_dependencies(
        &mut self,
        importer: &dyn Importer,
        checkout: &Checkout,
        name: &str,
        version: Option<&str>,
        relative_path: &Path,
    ) -> Result<BTreeMap<String, DependencyLists>, LoopError> {
        let full_path = self.config.recipe_dir.join(relative_path);

        if !self.config.update_existing && full_path.exists() {
            let text = std::fs::read_to_string(&full_path)?;
            return Ok(serde_json::from_str(&text)?);
        }

        tracing::info!(name, "calling find_deps extension");
        let text = importer.find_deps(checkout.dirname(), name, version).await?;
        let dependencies: BTreeMap<String, DependencyLists> =
            serde_json::from_str(&text).map_err(|e| LoopError::InvalidDependencies {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        import_fsutil::atomic_write(&full_path, serde_json::to_string(&dependencies)?.as_bytes()).await?;

        Ok(dependencies)
    }

    fn enqueue_dependencies(&mut self, current: PackageId) {
        let failed: HashSet<(String, String, String)> = self
            .errors
            .keys()
            .filter_map(|&id| self.arena.get(id))
            .map(|p| (p.kind.clone(), p.name.clone(), p.version.clone()))
            .collect();

        let (current_label, current_is_build_dep, direct_dependencies) = {
            let package = self.arena.get(current).expect("valid package id");
            (package.label(), package.is_build_dep, package.direct_dependencies.clone())
        };

        for (kind, lists) in direct_dependencies {
            self.process_dependency_list(
                current,
                &current_label,
                current_is_build_dep,
                &kind,
                &lists.build_dependencies,
                true,
                &failed,
            );
            self.process_dependency_list(
                current,
                &current_label,
                current_is_build_dep,
                &kind,
                &lists.runtime_dependencies,
                false,
                &failed,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_dependency_list(
        &mut self,
        current: PackageId,
        current_label: &str,
        current_is_build_dep: bool,
        kind: &str,
        deps: &BTreeMap<String, String>,
        these_are_build_deps: bool,
        failed: &HashSet<(String, String, String)>,
    ) {
        for (dep_name, dep_version) in deps {
            if failed.contains(&(kind.to_string(), dep_name.clone(), dep_version.clone())) {
                tracing::debug!(dep_name, dep_version, "skipping dependency of failed package");
                continue;
            }

            let dep_id = self
                .graph
                .find(&self.arena, kind, dep_name, dep_version)
                .or_else(|| {
                    self.queue
                        .iter()
                        .rev()
                        .copied()
                        .find(|&id| self.arena.get(id).is_some_and(|p| p.matches(kind, dep_name, dep_version)))
                })
                .unwrap_or_else(|| {
                    let id = self.arena.insert(Package::new(kind, dep_name.clone(), dep_version.clone()));
                    self.queue.push(id);
                    id
                });

            if let Some(dep) = self.arena.get_mut(dep_id) {
                dep.required_by.push(current_label.to_string());
            }

            if these_are_build_deps || current_is_build_dep {
                if let Some(dep) = self.arena.get_mut(dep_id) {
                    dep.is_build_dep = true;
                }
                self.graph.add_edge(dep_id, current);
            }
        }
    }
}

