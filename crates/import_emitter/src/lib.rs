//! Aggregate recipe emitter.
//!
//! Once the import loop has driven every reachable package to a recipe,
//! this module walks the build graph in build order and assembles a single
//! aggregate document (a "stratum": a flat list of chunks in the order they
//! must be built, each annotated with its own build-dependencies).

use std::path::{Path, PathBuf};

use import_graph::{GraphError, ProcessedGraph};
use import_package::PackageArena;
use import_recipe::RecipeSet;
use serde::Serialize;
use thiserror::Error;

/// Baseline stratum every generated aggregate declares a build-dependency
/// on, matching the source tool's hard-coded base stratum reference.
pub const DEFAULT_BASE_STRATUM: &str = "strata/build-essential.morph";

#[derive(Debug, Error)]
pub enum EmitterError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("package {label} has no recipe; cannot emit stratum")]
    MissingRecipe { label: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
struct ChunkEntry {
    name: String,
    repo: Option<String>,
    #[serde(rename = "ref")]
    commit_id: Option<String>,
    #[serde(rename = "unpetrify-ref")]
    named_ref: Option<String>,
    morph: String,
    #[serde(rename = "build-depends")]
    build_depends: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct BuildDependsEntry {
    morph: String,
}

#[derive(Debug, Clone, Serialize)]
struct Stratum {
    name: String,
    kind: &'static str,
    description: &'static str,
    #[serde(rename = "build-depends")]
    build_depends: Vec<BuildDependsEntry>,
    chunks: Vec<ChunkEntry>,
}

/// Decide whether the aggregate stratum for `goal_name` should be
/// (re)generated. Skips regeneration of an existing file unless
/// `update_existing` or `force` is set.
pub fn should_emit(recipe_dir: &Path, goal_name: &str, update_existing: bool, force: bool) -> bool {
    let path = stratum_path(recipe_dir, goal_name);
    if path.exists() && !update_existing && !force {
        tracing::info!(goal_name, path = %path.display(), "stratum already exists, not overwriting");
        return false;
    }
    true
}

fn stratum_path(recipe_dir: &Path, goal_name: &str) -> PathBuf {
    recipe_dir.join("strata").join(format!("{goal_name}.morph"))
}

/// Assemble and write the aggregate stratum document for `goal_name`,
/// walking `graph` in build order and pulling each chunk's recipe out of
/// `recipes`. `build-depends` for each chunk is the union of
/// `x-build-dependencies-{kind}` over every kind in `enabled_kinds`, not
/// just the chunk's own kind, since a goal may chase dependencies across
/// more than one ecosystem. When `force` is set, packages with no recipe
/// are logged and skipped instead of failing the whole emit. Returns the
/// path the stratum was written to.
pub async fn emit_stratum(
    arena: &PackageArena,
    graph: &ProcessedGraph,
    recipes: &RecipeSet,
    goal_name: &str,
    enabled_kinds: &[String],
    force: bool,
) -> Result<PathBuf, EmitterError> {
    let order = graph.topological_build_order(arena)?;

    let mut chunks = Vec::with_capacity(order.len());
    for id in &order {
        let package = arena.get(*id).expect("graph node refers to a live package");

        let recipe_path = match &package.recipe_path {
            Some(path) => path,
            None if force => {
                tracing::warn!(label = package.label(), "forcing stratum generation: skipping package with no recipe");
                continue;
            }
            None => return Err(EmitterError::MissingRecipe { label: package.label() }),
        };
        let recipe = match recipes.get_by_path(recipe_path) {
            Some(recipe) => recipe,
            None if force => {
                tracing::warn!(label = package.label(), "forcing stratum generation: skipping package with no recipe");
                continue;
            }
            None => return Err(EmitterError::MissingRecipe { label: package.label() }),
        };

        let build_depends = enabled_kinds
            .iter()
            .flat_map(|kind| {
                recipe
                    .build_dependencies(kind)
                    .into_iter()
                    .map(|(name, version)| format_build_dep(arena, graph, kind, &name, &version))
            })
            .collect();

        chunks.push(ChunkEntry {
            name: recipe.name.clone(),
            repo: recipe.repo_url.clone(),
            commit_id: recipe.commit_id.clone(),
            named_ref: recipe.named_ref.clone(),
            morph: recipe_path.to_string_lossy().into_owned(),
            build_depends,
        });
    }

    let stratum = Stratum {
        name: goal_name.to_string(),
        kind: "stratum",
        description: "Autogenerated by the import tool",
        build_depends: vec![BuildDependsEntry {
            morph: DEFAULT_BASE_STRATUM.to_string(),
        }],
        chunks,
    };

    let path = stratum_path(recipes.root(), goal_name);
    let contents = serde_json::to_string_pretty(&stratum)?;
    import_fsutil::atomic_write(&path, contents.as_bytes()).await?;

    tracing::info!(goal_name, path = %path.display(), "wrote aggregate stratum");

    Ok(path)
}

/// Resolve `name`'s `version_in_use` by finding it in the graph, falling
/// back to the requested `version` if the dependency was never tracked
/// (shouldn't happen for a consistent graph, but keeps this infallible).
fn format_build_dep(arena: &PackageArena, graph: &ProcessedGraph, kind: &str, name: &str, version: &str) -> String {
    match graph.find(arena, kind, name, version) {
        Some(id) => {
            let dep_package = arena.get(id).expect("graph node refers to a live package");
            format!("{name}-{}", dep_package.version_in_use)
        }
        None => {
            tracing::warn!(name, version, "build-dependency not found in graph, using requested version");
            format!("{name}-{version}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use import_package::Package;
    use import_recipe::Recipe;
    use std::collections::BTreeMap;

    async fn recipe_set_with(dir: &Path, path: &str, recipe: Recipe) -> RecipeSet {
        let mut set = RecipeSet::load_all(dir).unwrap();
        set.save(path, recipe).await.unwrap();
        set
    }

    #[tokio::test]
    async fn emits_chunks_in_build_order_with_resolved_build_depends() {
        let dir = tempfile::tempdir().unwrap();

        let mut arena = PackageArena::new();
        let mut base = Package::new("pypi", "setuptools", "40.0");
        base.version_in_use = "40.0".to_string();
        base.recipe_path = Some(PathBuf::from("strata/goal/setuptools-40.0.morph"));
        let base_id = arena.insert(base);

        let mut top = Package::new("pypi", "flask", "1.0");
        top.version_in_use = "1.0".to_string();
        top.recipe_path = Some(PathBuf::from("strata/goal/flask-1.0.morph"));
        let top_id = arena.insert(top);

        let mut graph = ProcessedGraph::new();
        graph.add_edge(base_id, top_id);

        let mut extra = BTreeMap::new();
        extra.insert(
            "x-build-dependencies-pypi".to_string(),
            serde_json::json!({"setuptools": "40.0"}),
        );

        let mut recipes = recipe_set_with(
            dir.path(),
            "strata/goal/setuptools-40.0.morph",
            Recipe {
                name: "setuptools".into(),
                kind: "chunk".into(),
                repo_url: Some("upstream:setuptools".into()),
                commit_id: Some("aaaa".into()),
                named_ref: Some("40.0".into()),
                ..Default::default()
            },
        )
        .await;
        recipes
            .save(
                "strata/goal/flask-1.0.morph",
                Recipe {
                    name: "flask".into(),
                    kind: "chunk".into(),
                    repo_url: Some("upstream:flask".into()),
                    commit_id: Some("bbbb".into()),
                    named_ref: Some("1.0".into()),
                    extra,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let enabled_kinds = vec!["pypi".to_string()];
        let path = emit_stratum(&arena, &graph, &recipes, "goal", &enabled_kinds, false)
            .await
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();

        assert_eq!(parsed["kind"], "stratum");
        let chunk_names: Vec<&str> = parsed["chunks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(chunk_names, vec!["setuptools", "flask"]);
        assert_eq!(
            parsed["chunks"][1]["build-depends"],
            serde_json::json!(["setuptools-40.0"])
        );
    }

    #[tokio::test]
    async fn build_depends_unions_every_enabled_kind_not_just_the_chunks_own() {
        let dir = tempfile::tempdir().unwrap();

        let mut arena = PackageArena::new();
        let mut pypi_base = Package::new("pypi", "setuptools", "40.0");
        pypi_base.version_in_use = "40.0".to_string();
        pypi_base.recipe_path = Some(PathBuf::from("strata/goal/setuptools-40.0.morph"));
        let pypi_base_id = arena.insert(pypi_base);

        let mut npm_base = Package::new("npm", "node-gyp", "9.0");
        npm_base.version_in_use = "9.0".to_string();
        npm_base.recipe_path = Some(PathBuf::from("strata/goal/node-gyp-9.0.morph"));
        let npm_base_id = arena.insert(npm_base);

        let mut top = Package::new("pypi", "flask", "1.0");
        top.version_in_use = "1.0".to_string();
        top.recipe_path = Some(PathBuf::from("strata/goal/flask-1.0.morph"));
        let top_id = arena.insert(top);

        let mut graph = ProcessedGraph::new();
        graph.add_edge(pypi_base_id, top_id);
        graph.add_edge(npm_base_id, top_id);

        let mut extra = BTreeMap::new();
        extra.insert(
            "x-build-dependencies-pypi".to_string(),
            serde_json::json!({"setuptools": "40.0"}),
        );
        extra.insert(
            "x-build-dependencies-npm".to_string(),
            serde_json::json!({"node-gyp": "9.0"}),
        );

        let mut recipes = recipe_set_with(
            dir.path(),
            "strata/goal/setuptools-40.0.morph",
            Recipe {
                name: "setuptools".into(),
                kind: "chunk".into(),
                ..Default::default()
            },
        )
        .await;
        recipes
            .save(
                "strata/goal/node-gyp-9.0.morph",
                Recipe {
                    name: "node-gyp".into(),
                    kind: "chunk".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        recipes
            .save(
                "strata/goal/flask-1.0.morph",
                Recipe {
                    name: "flask".into(),
                    kind: "chunk".into(),
                    extra,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let enabled_kinds = vec!["pypi".to_string(), "npm".to_string()];
        let path = emit_stratum(&arena, &graph, &recipes, "goal", &enabled_kinds, false)
            .await
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();

        let flask_depends = parsed["chunks"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["name"] == "flask")
            .unwrap()["build-depends"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect::<Vec<_>>();

        assert_eq!(flask_depends, vec!["setuptools-40.0".to_string(), "node-gyp-9.0".to_string()]);
    }

    #[tokio::test]
    async fn force_skips_packages_with_no_recipe_instead_of_erroring() {
        let dir = tempfile::tempdir().unwrap();

        let mut arena = PackageArena::new();
        let mut has_recipe = Package::new("pypi", "flask", "1.0");
        has_recipe.version_in_use = "1.0".to_string();
        has_recipe.recipe_path = Some(PathBuf::from("strata/goal/flask-1.0.morph"));
        let has_recipe_id = arena.insert(has_recipe);

        let missing_recipe = Package::new("pypi", "werkzeug", "2.0");
        let missing_recipe_id = arena.insert(missing_recipe);

        let mut graph = ProcessedGraph::new();
        graph.add_node(has_recipe_id);
        graph.add_node(missing_recipe_id);

        let recipes = recipe_set_with(
            dir.path(),
            "strata/goal/flask-1.0.morph",
            Recipe {
                name: "flask".into(),
                kind: "chunk".into(),
                ..Default::default()
            },
        )
        .await;

        let enabled_kinds = vec!["pypi".to_string()];

        let without_force = emit_stratum(&arena, &graph, &recipes, "goal", &enabled_kinds, false).await;
        assert!(matches!(without_force, Err(EmitterError::MissingRecipe { .. })));

        let path = emit_stratum(&arena, &graph, &recipes, "goal", &enabled_kinds, true)
            .await
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        let chunk_names: Vec<&str> = parsed["chunks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(chunk_names, vec!["flask"]);
    }

    #[test]
    fn should_emit_false_when_stratum_exists_and_not_updating() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("strata")).unwrap();
        std::fs::write(dir.path().join("strata/goal.morph"), "{}").unwrap();

        assert!(!should_emit(dir.path(), "goal", false, false));
        assert!(should_emit(dir.path(), "goal", true, false));
        assert!(should_emit(dir.path(), "goal", false, true));
    }

    #[test]
    fn should_emit_true_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(should_emit(dir.path(), "goal", false, false));
    }
}
