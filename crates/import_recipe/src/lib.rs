//! Recipe set.
//!
//! A recipe is the per-package build instruction document an extension
//! produces (`<kind>.to_chunk`). Recipes are keyed on disk by their file
//! path, but also carry an annotation of which upstream commit they were
//! generated against (`repo_url`/`ref`) once the import loop has attached
//! them to a checkout; freshly loaded recipes have these unset.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("error parsing recipe {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A per-package build recipe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub kind: String,
    /// Set once the recipe has been tied to a specific checkout.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub repo_url: Option<String>,
    /// The resolved commit id, set alongside `repo_url`.
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none", default)]
    pub commit_id: Option<String>,
    /// The human-readable ref (tag/branch name) that resolved to `commit_id`.
    #[serde(
        rename = "named-ref",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub named_ref: Option<String>,
    /// Everything else an extension produced: build system hints,
    /// `x-build-dependencies-<kind>` maps, etc.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Recipe {
    /// Build-dependencies declared for ecosystem `kind`, as
    /// `(name, version)` pairs.
    pub fn build_dependencies(&self, kind: &str) -> Vec<(String, String)> {
        let key = format!("x-build-dependencies-{kind}");
        match self.extra.get(&key) {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(name, version)| {
                    version.as_str().map(|v| (name.clone(), v.to_string()))
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RecipeKey {
    path: PathBuf,
    repo_url: Option<String>,
    commit_id: Option<String>,
}

/// The set of all recipes loaded from, or saved to, a recipe directory.
#[derive(Debug, Default)]
pub struct RecipeSet {
    root: PathBuf,
    entries: Vec<(RecipeKey, Recipe)>,
}

impl RecipeSet {
    pub fn load_all(root: impl Into<PathBuf>) -> Result<Self, RecipeError> {
        let root = root.into();
        let mut entries = Vec::new();

        if !root.exists() {
            std::fs::create_dir_all(&root).map_err(|source| RecipeError::Io {
                path: root.clone(),
                source,
            })?;
            return Ok(Self { root, entries });
        }

        for path in walk_recipe_files(&root)? {
            let text = std::fs::read_to_string(&path).map_err(|source| RecipeError::Io {
                path: path.clone(),
                source,
            })?;
            let mut recipe: Recipe =
                serde_json::from_str(&text).map_err(|source| RecipeError::Parse {
                    path: path.clone(),
                    source,
                })?;
            recipe.repo_url = None;
            recipe.commit_id = None;
            let relative = path.strip_prefix(&root).unwrap_or(&path).to_path_buf();
            entries.push((
                RecipeKey {
                    path: relative,
                    repo_url: None,
                    commit_id: None,
                },
                recipe,
            ));
        }

        Ok(Self { root, entries })
    }

    /// Look up a recipe by `(repo_url, commit_id, path)`. Falls back to an
    /// unattached lookup (both absent) so that freshly-loaded-from-disk
    /// recipes that haven't yet been annotated can still be found.
    pub fn get(
        &self,
        repo_url: Option<&str>,
        commit_id: Option<&str>,
        path: &Path,
    ) -> Option<&Recipe> {
        self.entries
            .iter()
            .find(|(key, _)| {
                key.path == path
                    && key.repo_url.as_deref() == repo_url
                    && key.commit_id.as_deref() == commit_id
            })
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|(key, _)| key.path == path && key.repo_url.is_none() && key.commit_id.is_none())
            })
            .map(|(_, recipe)| recipe)
    }

    /// Register and persist a recipe at `path` (relative to the recipe
    /// directory), eliding default-valued fields.
    pub async fn save(&mut self, path: impl Into<PathBuf>, recipe: Recipe) -> Result<(), RecipeError> {
        let path = path.into();
        tracing::debug!(path = %path.display(), "saving recipe");

        let key = RecipeKey {
            path: path.clone(),
            repo_url: recipe.repo_url.clone(),
            commit_id: recipe.commit_id.clone(),
        };
        self.entries.retain(|(existing_key, _)| existing_key.path != path);
        self.entries.push((key, recipe.clone()));

        let full_path = self.root.join(&path);
        let contents = serde_json::to_string_pretty(&recipe).map_err(|source| RecipeError::Parse {
            path: full_path.clone(),
            source,
        })?;
        import_fsutil::atomic_write(&full_path, contents.as_bytes())
            .await
            .map_err(|source| RecipeError::Io {
                path: full_path,
                source,
            })?;

        Ok(())
    }

    /// Look up a recipe by path alone, ignoring its `(repo_url, commit_id)`
    /// annotation. Useful once a recipe has already been resolved and saved
    /// for a specific package, since `save` keeps at most one entry per path.
    pub fn get_by_path(&self, path: &Path) -> Option<&Recipe> {
        self.entries.iter().find(|(key, _)| key.path == path).map(|(_, recipe)| recipe)
    }

    pub fn exists_on_disk(&self, path: &Path) -> bool {
        self.root.join(path).exists()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn walk_recipe_files(root: &Path) -> Result<Vec<PathBuf>, RecipeError> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let read_dir = std::fs::read_dir(&dir).map_err(|source| RecipeError::Io {
            path: dir.clone(),
            source,
        })?;
        for entry in read_dir {
            let entry = entry.map_err(|source| RecipeError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("morph") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}
