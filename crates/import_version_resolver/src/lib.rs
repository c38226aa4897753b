//! Version-constraint resolver.
//!
//! Consumes per-project requirement lists of `(op, version)` pairs and
//! either merges them into a conflict-free constraint set or reports the
//! first pair of constraints that cannot both hold. This mirrors the
//! conflict-detection logic an extension such as a PyPI dependency-finder
//! needs before it can report a package's resolved requirements.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use pep440_rs::Version;
use thiserror::Error;

/// One of the six comparison operators a requirement spec may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Eq => "==",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Op {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "==" => Ok(Op::Eq),
            "!=" => Ok(Op::Ne),
            "<" => Ok(Op::Lt),
            "<=" => Ok(Op::Le),
            ">" => Ok(Op::Gt),
            ">=" => Ok(Op::Ge),
            other => Err(ResolverError::UnmatchedOperator {
                op: other.to_string(),
            }),
        }
    }
}

/// An operator paired with a parsed version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionedSpec {
    pub op: Op,
    pub version: Version,
}

impl fmt::Display for VersionedSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.version)
    }
}

/// A single project's raw requirement: its name plus the `(op, version)`
/// spec strings attached to it.
#[derive(Debug, Clone)]
pub struct Requirement {
    pub name: String,
    pub specs: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("unmatched operator: {op}")]
    UnmatchedOperator { op: String },
    #[error("invalid version literal: {version}")]
    InvalidVersion { version: String },
    #[error("conflicting specs for {name}: {} vs {}", specs[0], specs[1])]
    Conflict {
        name: String,
        specs: Vec<VersionedSpec>,
    },
}

/// Returns whether two specs on the same project cannot both hold.
fn conflicts(a: &VersionedSpec, b: &VersionedSpec) -> bool {
    use Op::*;
    match (a.op, b.op) {
        (Eq, Eq) => a.version != b.version,
        (Eq, Ne) => a.version == b.version,
        (Ne, Eq) => a.version == b.version,
        (Eq, Lt) => a.version >= b.version,
        (Lt, Eq) => b.version >= a.version,
        (Eq, Le) => a.version > b.version,
        (Le, Eq) => b.version > a.version,
        (Eq, Gt) => a.version <= b.version,
        (Gt, Eq) => b.version <= a.version,
        (Eq, Ge) => a.version < b.version,
        (Ge, Eq) => b.version < a.version,
        (Lt, Gt) => a.version <= b.version,
        (Gt, Lt) => b.version <= a.version,
        (Lt, Ge) => a.version <= b.version,
        (Ge, Lt) => b.version <= a.version,
        (Le, Ge) => a.version < b.version,
        (Ge, Le) => b.version < a.version,
        (Gt, Le) => a.version >= b.version,
        (Le, Gt) => b.version >= a.version,
        _ => false,
    }
}

/// Merge requirements grouped by project name into a conflict-free set of
/// specs, or report the first conflicting pair encountered (in the order
/// the requirements were given).
pub fn resolve(
    requirements: impl IntoIterator<Item = Requirement>,
) -> Result<BTreeMap<String, BTreeSet<VersionedSpec>>, ResolverError> {
    let mut per_name: BTreeMap<String, Vec<VersionedSpec>> = BTreeMap::new();

    for requirement in requirements {
        for (op_str, version_str) in requirement.specs {
            let op = Op::from_str(&op_str)?;
            let version = Version::from_str(&version_str).map_err(|_| ResolverError::InvalidVersion {
                version: version_str.clone(),
            })?;
            let spec = VersionedSpec { op, version };

            let bucket = per_name.entry(requirement.name.clone()).or_default();
            if bucket.contains(&spec) {
                continue;
            }
            for existing in bucket.iter() {
                if conflicts(existing, &spec) {
                    return Err(ResolverError::Conflict {
                        name: requirement.name.clone(),
                        specs: vec![existing.clone(), spec],
                    });
                }
            }
            bucket.push(spec);
        }
    }

    Ok(per_name
        .into_iter()
        .map(|(name, specs)| (name, specs.into_iter().collect()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(name: &str, specs: &[(&str, &str)]) -> Requirement {
        Requirement {
            name: name.to_string(),
            specs: specs
                .iter()
                .map(|(op, v)| (op.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn spec(op: Op, version: &str) -> VersionedSpec {
        VersionedSpec {
            op,
            version: Version::from_str(version).unwrap(),
        }
    }

    fn assert_conflict(requirements: Vec<Requirement>, expected: [VersionedSpec; 2]) {
        let err = resolve(requirements).unwrap_err();
        match err {
            ResolverError::Conflict { specs, .. } => assert_eq!(specs, expected.to_vec()),
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn eqs_eqs_conflict_both_orders() {
        assert_conflict(
            vec![req("a", &[("==", "0.1"), ("==", "0.2")])],
            [spec(Op::Eq, "0.1"), spec(Op::Eq, "0.2")],
        );
        assert_conflict(
            vec![req("a", &[("==", "0.2"), ("==", "0.1")])],
            [spec(Op::Eq, "0.2"), spec(Op::Eq, "0.1")],
        );
    }

    #[test]
    fn eq_conflicts_with_ne_at_same_version() {
        assert_conflict(
            vec![req("a", &[("==", "0.1"), ("!=", "0.1")])],
            [spec(Op::Eq, "0.1"), spec(Op::Ne, "0.1")],
        );
    }

    #[test]
    fn eq_conflicts_with_lt_when_ge() {
        assert_conflict(
            vec![req("a", &[("==", "0.2"), ("<", "0.1")])],
            [spec(Op::Eq, "0.2"), spec(Op::Lt, "0.1")],
        );
        assert_conflict(
            vec![req("a", &[("==", "0.1"), ("<", "0.1")])],
            [spec(Op::Eq, "0.1"), spec(Op::Lt, "0.1")],
        );
    }

    #[test]
    fn eq_conflicts_with_gt_when_le() {
        assert_conflict(
            vec![req("a", &[("==", "0.1"), (">", "0.1")])],
            [spec(Op::Eq, "0.1"), spec(Op::Gt, "0.1")],
        );
        assert_conflict(
            vec![req("a", &[("==", "0.1"), (">", "0.2")])],
            [spec(Op::Eq, "0.1"), spec(Op::Gt, "0.2")],
        );
    }

    #[test]
    fn eq_lte_conflicts_unless_equal() {
        assert_conflict(
            vec![req("a", &[("==", "0.2"), ("<=", "0.1")])],
            [spec(Op::Eq, "0.2"), spec(Op::Le, "0.1")],
        );
        let merged = resolve(vec![req("a", &[("==", "0.1"), ("<=", "0.1")])]).unwrap();
        assert_eq!(
            merged["a"],
            BTreeSet::from([spec(Op::Eq, "0.1"), spec(Op::Le, "0.1")])
        );
    }

    #[test]
    fn eq_gte_conflicts_unless_equal() {
        assert_conflict(
            vec![req("a", &[("==", "0.1"), (">=", "0.2")])],
            [spec(Op::Eq, "0.1"), spec(Op::Ge, "0.2")],
        );
        let merged = resolve(vec![req("a", &[("==", "0.1"), (">=", "0.1")])]).unwrap();
        assert_eq!(
            merged["a"],
            BTreeSet::from([spec(Op::Eq, "0.1"), spec(Op::Ge, "0.1")])
        );
    }

    #[test]
    fn lt_lt_never_conflicts_and_dedups() {
        let merged = resolve(vec![req("a", &[("<", "0.1"), ("<", "0.1")])]).unwrap();
        assert_eq!(merged["a"], BTreeSet::from([spec(Op::Lt, "0.1")]));

        let merged = resolve(vec![req("a", &[("<", "0.1"), ("<", "0.2")])]).unwrap();
        assert_eq!(merged["a"], BTreeSet::from([spec(Op::Lt, "0.1"), spec(Op::Lt, "0.2")]));
    }

    #[test]
    fn lt_gt_conflicts_when_le() {
        assert_conflict(
            vec![req("a", &[("<", "0.1"), (">", "0.1")])],
            [spec(Op::Lt, "0.1"), spec(Op::Gt, "0.1")],
        );
        assert_conflict(
            vec![req("a", &[("<", "0.1"), (">", "0.2")])],
            [spec(Op::Lt, "0.1"), spec(Op::Gt, "0.2")],
        );
    }

    #[test]
    fn lt_lte_never_conflicts() {
        let merged = resolve(vec![req("a", &[("<", "0.1"), ("<=", "0.2")])]).unwrap();
        assert_eq!(merged["a"], BTreeSet::from([spec(Op::Lt, "0.1"), spec(Op::Le, "0.2")]));
    }

    #[test]
    fn lt_gte_conflicts_when_le() {
        assert_conflict(
            vec![req("a", &[("<", "0.1"), (">=", "0.1")])],
            [spec(Op::Lt, "0.1"), spec(Op::Ge, "0.1")],
        );
    }

    #[test]
    fn gt_gt_never_conflicts() {
        let merged = resolve(vec![req("a", &[(">", "0.1"), (">", "0.2")])]).unwrap();
        assert_eq!(merged["a"], BTreeSet::from([spec(Op::Gt, "0.1"), spec(Op::Gt, "0.2")]));
    }

    #[test]
    fn gt_lte_conflicts_when_ge() {
        assert_conflict(
            vec![req("a", &[(">", "0.1"), ("<=", "0.1")])],
            [spec(Op::Gt, "0.1"), spec(Op::Le, "0.1")],
        );
        assert_conflict(
            vec![req("a", &[(">", "0.2"), ("<=", "0.1")])],
            [spec(Op::Gt, "0.2"), spec(Op::Le, "0.1")],
        );
    }

    #[test]
    fn gt_gte_never_conflicts() {
        let merged = resolve(vec![req("a", &[(">", "0.1"), (">=", "0.1")])]).unwrap();
        assert_eq!(merged["a"], BTreeSet::from([spec(Op::Gt, "0.1"), spec(Op::Ge, "0.1")]));
    }

    #[test]
    fn lte_lte_never_conflicts() {
        let merged = resolve(vec![req("a", &[("<=", "0.1"), ("<=", "0.2")])]).unwrap();
        assert_eq!(merged["a"], BTreeSet::from([spec(Op::Le, "0.1"), spec(Op::Le, "0.2")]));
    }

    #[test]
    fn lte_gte_boundary_is_feasible() {
        let merged = resolve(vec![req("a", &[("<=", "0.1"), (">=", "0.1")])]).unwrap();
        assert_eq!(merged["a"], BTreeSet::from([spec(Op::Le, "0.1"), spec(Op::Ge, "0.1")]));

        assert_conflict(
            vec![req("a", &[("<=", "0.1"), (">=", "0.2")])],
            [spec(Op::Le, "0.1"), spec(Op::Ge, "0.2")],
        );
    }

    #[test]
    fn gte_gte_never_conflicts() {
        let merged = resolve(vec![req("a", &[(">=", "0.1"), (">=", "0.2")])]).unwrap();
        assert_eq!(merged["a"], BTreeSet::from([spec(Op::Ge, "0.1"), spec(Op::Ge, "0.2")]));
    }

    #[test]
    fn ne_never_conflicts_with_non_eq_comparators() {
        for op in ["<", ">", "<=", ">="] {
            let merged = resolve(vec![req("a", &[("!=", "0.1"), (op, "0.1")])]).unwrap();
            assert_eq!(merged["a"].len(), 2);
        }
    }

    #[test]
    fn unmatched_operator_is_rejected() {
        let err = resolve(vec![req("a", &[("===", "0.1")])]).unwrap_err();
        assert!(matches!(err, ResolverError::UnmatchedOperator { .. }));
    }

    #[test]
    fn distinct_project_names_never_conflict_with_each_other() {
        let merged = resolve(vec![req("a", &[("==", "0.1")]), req("b", &[("==", "0.1")])]).unwrap();
        assert_eq!(merged["a"], BTreeSet::from([spec(Op::Eq, "0.1")]));
        assert_eq!(merged["b"], BTreeSet::from([spec(Op::Eq, "0.1")]));
    }

    #[test]
    fn idempotent_on_duplicated_requirement_list() {
        let requirements = vec![req("a", &[("==", "0.1")]), req("b", &[(">", "0.1"), ("<", "0.3")])];
        let once = resolve(requirements.clone()).unwrap();
        let twice = resolve(requirements.into_iter().chain(
            vec![req("a", &[("==", "0.1")]), req("b", &[(">", "0.1"), ("<", "0.3")])].into_iter(),
        ))
        .unwrap();
        assert_eq!(once, twice);
    }
}
