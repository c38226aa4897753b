//! Package records tracked by the import loop.
//!
//! A [`Package`] identifies one `(kind, name, version)` triple discovered
//! while importing a goal package. Records are mutable (the loop fills in
//! `version_in_use`, `recipe_path`, and dependency information as it makes
//! progress) and are stored in a [`PackageArena`] so that every other
//! structure (queue, graph, `required_by` entries) can hold a cheap, stable
//! [`PackageId`] instead of a reference or a clone.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Stable handle into a [`PackageArena`].
    pub struct PackageId;
}

/// The dependency lists an extension reported for one ecosystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyLists {
    #[serde(rename = "build-dependencies", default)]
    pub build_dependencies: BTreeMap<String, String>,
    #[serde(rename = "runtime-dependencies", default)]
    pub runtime_dependencies: BTreeMap<String, String>,
}

/// A single tracked package.
#[derive(Debug, Clone)]
pub struct Package {
    /// The foreign-ecosystem tag, e.g. `"pypi"`.
    pub kind: String,
    pub name: String,
    /// The version that was requested when this package was enqueued.
    pub version: String,
    /// The version actually checked out (may differ if a fallback ref was
    /// used). Starts out equal to `version`.
    pub version_in_use: String,
    /// Labels of the parents that caused this package to be enqueued, in
    /// enqueue order. Formatted `"{name}-{version}"` (kind is intentionally
    /// omitted, matching the originating tool's label format).
    pub required_by: Vec<String>,
    /// Path of the per-package recipe once generated, relative to the
    /// recipe directory.
    pub recipe_path: Option<PathBuf>,
    /// Direct dependencies discovered for this package, keyed by the kind
    /// of ecosystem the dependency entries belong to.
    pub direct_dependencies: BTreeMap<String, DependencyLists>,
    /// Whether this package is a build-dependency of some other tracked
    /// package (set via role inheritance, see the import loop).
    pub is_build_dep: bool,
}

impl Package {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        let version = version.into();
        Self {
            kind: kind.into(),
            name: name.into(),
            version_in_use: version.clone(),
            version,
            required_by: Vec::new(),
            recipe_path: None,
            direct_dependencies: BTreeMap::new(),
            is_build_dep: false,
        }
    }

    /// Identity predicate used for queue/graph deduplication lookups.
    pub fn matches(&self, kind: &str, name: &str, version: &str) -> bool {
        self.kind == kind && self.name == name && self.version == version
    }

    /// Label used in a dependent's `required_by` list.
    pub fn label(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    pub fn add_required_by(&mut self, parent: &Package) {
        self.required_by.push(parent.label());
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for Package {}
impl PartialOrd for Package {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Package {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

/// Arena of [`Package`] records addressed by stable [`PackageId`] handles.
#[derive(Debug, Default)]
pub struct PackageArena {
    slots: slotmap::SlotMap<PackageId, Package>,
}

impl PackageArena {
    pub fn new() -> Self {
        Self {
            slots: slotmap::SlotMap::with_key(),
        }
    }

    pub fn insert(&mut self, package: Package) -> PackageId {
        self.slots.insert(package)
    }

    pub fn get(&self, id: PackageId) -> Option<&Package> {
        self.slots.get(id)
    }

    pub fn get_mut(&mut self, id: PackageId) -> Option<&mut Package> {
        self.slots.get_mut(id)
    }

    /// Linear scan for a package matching the identity triple.
    pub fn find(&self, kind: &str, name: &str, version: &str) -> Option<PackageId> {
        self.slots
            .iter()
            .find(|(_, package)| package.matches(kind, name, version))
            .map(|(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PackageId, &Package)> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
