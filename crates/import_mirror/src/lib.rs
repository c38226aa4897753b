//! Mirror descriptor set.
//!
//! A descriptor points at the upstream repository for one named project. A
//! descriptor *file* holds one or more entries; the filename is unrelated to
//! any project name it contains. This module loads every descriptor file
//! beneath a directory, enforces project-name uniqueness, and lets the
//! import loop look one up by the foreign package it claims to satisfy
//! (`x-products-<kind>`) or merge a freshly-discovered one in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Suffix used for descriptor files on disk.
pub const DESCRIPTOR_EXTENSION: &str = "lorry";

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("error parsing descriptor file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}: duplicates existing descriptor for {name}")]
    DuplicateName { path: PathBuf, name: String },
    #[error("descriptor for {project_name} conflicts with existing entry at field {field}")]
    Conflict { project_name: String, field: String },
    #[error("invalid descriptor {file_stem}: expected exactly one entry, got {count}")]
    NotSingleEntry { file_stem: String, count: usize },
    #[error("invalid descriptor {file_stem}: empty project name")]
    EmptyName { file_stem: String },
    #[error("invalid descriptor {file_stem}: url field for {project_name} is missing or not a string")]
    InvalidUrl {
        file_stem: String,
        project_name: String,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One descriptor entry: an upstream repository URL plus arbitrary
/// extension-tagged fields (always prefixed `x-`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorEntry {
    pub url: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl DescriptorEntry {
    pub fn products(&self, kind: &str) -> Vec<String> {
        let key = format!("x-products-{kind}");
        match self.extra.get(&key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn merge_from(&mut self, new: &DescriptorEntry, project_name: &str) -> Result<(), MirrorError> {
        let matches = self.url.trim_end_matches('/') == new.url.trim_end_matches('/');
        if !matches {
            return Err(MirrorError::Conflict {
                project_name: project_name.to_string(),
                field: "url".to_string(),
            });
        }

        let is_products_field = |f: &str| f.starts_with("x-products-");

        for (field, value) in &new.extra {
            if !is_products_field(field) {
                continue;
            }
            match self.extra.get_mut(field) {
                Some(Value::Array(existing_items)) => {
                    if let Value::Array(new_items) = value {
                        let mut set: std::collections::BTreeSet<String> = existing_items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_owned))
                            .collect();
                        set.extend(new_items.iter().filter_map(|v| v.as_str().map(str::to_owned)));
                        *existing_items = set.into_iter().map(Value::String).collect();
                    }
                }
                _ => {
                    self.extra.insert(field.clone(), value.clone());
                }
            }
        }

        Ok(())
    }
}

/// A single descriptor file's on-disk shape: a map of project name to entry.
pub type DescriptorFile = BTreeMap<String, DescriptorEntry>;

/// The set of all descriptors loaded beneath a directory.
#[derive(Debug, Default)]
pub struct MirrorDescriptorSet {
    root: PathBuf,
    entries: BTreeMap<String, DescriptorEntry>,
}

impl MirrorDescriptorSet {
    /// Load every `.lorry` file beneath `root`, creating `root` if it
    /// doesn't yet exist.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, MirrorError> {
        let root = root.into();
        let mut entries = BTreeMap::new();

        if !root.exists() {
            std::fs::create_dir_all(&root).map_err(|source| MirrorError::Io {
                path: root.clone(),
                source,
            })?;
            return Ok(Self { root, entries });
        }

        for path in walk_descriptor_files(&root)? {
            let text = std::fs::read_to_string(&path).map_err(|source| MirrorError::Io {
                path: path.clone(),
                source,
            })?;
            let file: DescriptorFile =
                serde_json::from_str(&text).map_err(|source| MirrorError::Parse {
                    path: path.clone(),
                    source,
                })?;
            for (name, entry) in file {
                if entries.contains_key(&name) {
                    return Err(MirrorError::DuplicateName { path, name });
                }
                entries.insert(name, entry);
            }
        }

        Ok(Self { root, entries })
    }

    /// Find the descriptor matching a single `x-products-<kind>` entry.
    pub fn find_by_product(&self, kind: &str, package_name: &str) -> Option<(&str, &DescriptorEntry)> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.products(kind).iter().any(|p| p == package_name))
            .map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn get(&self, project_name: &str) -> Option<&DescriptorEntry> {
        self.entries.get(project_name)
    }

    /// Add (or merge) a single-entry descriptor into the file named
    /// `<file_stem>.lorry`, persisting atomically.
    pub async fn add(
        &mut self,
        file_stem: &str,
        project_name: &str,
        entry: DescriptorEntry,
    ) -> Result<(), MirrorError> {
        if project_name.is_empty() {
            return Err(MirrorError::EmptyName {
                file_stem: file_stem.to_string(),
            });
        }
        if entry.url.is_empty() {
            return Err(MirrorError::InvalidUrl {
                file_stem: file_stem.to_string(),
                project_name: project_name.to_string(),
            });
        }

        tracing::debug!(file_stem, project_name, "adding descriptor");

        let path = self.root.join(format!("{file_stem}.{DESCRIPTOR_EXTENSION}"));

        let merged_entry = if let Some(existing) = self.entries.get_mut(project_name) {
            existing.merge_from(&entry, project_name)?;
            existing.clone()
        } else {
            self.entries.insert(project_name.to_string(), entry.clone());
            entry
        };

        let mut on_disk: DescriptorFile = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| MirrorError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&text).map_err(|source| MirrorError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            BTreeMap::new()
        };
        on_disk.insert(project_name.to_string(), merged_entry);

        let contents = serde_json::to_string_pretty(&on_disk).expect("BTreeMap keys are sorted");
        import_fsutil::atomic_write(&path, contents.as_bytes())
            .await
            .map_err(|source| MirrorError::Io { path, source })?;

        Ok(())
    }
}

fn walk_descriptor_files(root: &Path) -> Result<Vec<PathBuf>, MirrorError> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let read_dir = std::fs::read_dir(&dir).map_err(|source| MirrorError::Io {
            path: dir.clone(),
            source,
        })?;
        for entry in read_dir {
            let entry = entry.map_err(|source| MirrorError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some(DESCRIPTOR_EXTENSION) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, products: &[&str]) -> DescriptorEntry {
        let mut extra = BTreeMap::new();
        extra.insert(
            "x-products-pypi".to_string(),
            Value::Array(products.iter().map(|p| Value::String(p.to_string())).collect()),
        );
        DescriptorEntry {
            url: url.to_string(),
            extra,
        }
    }

    #[tokio::test]
    async fn add_then_find_by_product() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = MirrorDescriptorSet::load(dir.path()).unwrap();
        set.add("flask", "flask", entry("https://example.com/flask", &["Flask"]))
            .await
            .unwrap();

        let (name, found) = set.find_by_product("pypi", "Flask").unwrap();
        assert_eq!(name, "flask");
        assert_eq!(found.url, "https://example.com/flask");
    }

    #[tokio::test]
    async fn merge_unions_product_fields_and_tolerates_trailing_slash() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = MirrorDescriptorSet::load(dir.path()).unwrap();
        set.add("p", "p", entry("https://example.com/p/", &["a"]))
            .await
            .unwrap();
        set.add("p", "p", entry("https://example.com/p", &["b"]))
            .await
            .unwrap();

        let merged = set.get("p").unwrap();
        let mut products = merged.products("pypi");
        products.sort();
        assert_eq!(products, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn conflicting_url_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = MirrorDescriptorSet::load(dir.path()).unwrap();
        set.add("p", "p", entry("https://example.com/p", &["a"]))
            .await
            .unwrap();

        let err = set
            .add("p", "p", entry("https://example.com/other", &["a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Conflict { .. }));
    }

    #[test]
    fn duplicate_name_across_files_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.lorry"),
            r#"{"p": {"url": "https://example.com/p"}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.lorry"),
            r#"{"p": {"url": "https://example.com/p"}}"#,
        )
        .unwrap();

        let err = MirrorDescriptorSet::load(dir.path()).unwrap_err();
        assert!(matches!(err, MirrorError::DuplicateName { .. }));
    }
}
