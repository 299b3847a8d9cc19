//! Decides which entries of the script tree ship with a script.
//!
//! An entry is selected when it is the tree root, when it is the script file
//! itself, or when any dependency predicate accepts it. The checks are
//! independent; one hit is enough.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use regex::Regex;

use super::fs::{EntryKind, FileTree, TreeEntry};
use crate::config::DependencyRule;
use crate::error::{DispatchError, Result};

/// Validated script identifier, without extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptName(String);

impl ScriptName {
    /// Accepts `login_flow` or `login_flow.py`; rejects anything that could
    /// escape the script root.
    pub fn parse(raw: &str, extension: &str) -> Result<Self> {
        let raw = raw.trim();
        let suffix = format!(".{extension}");
        let name = raw.strip_suffix(suffix.as_str()).unwrap_or(raw);

        if name.is_empty() {
            return Err(DispatchError::validation("script", "must not be empty"));
        }
        if name.starts_with('.') || name.contains(['/', '\\']) || name.contains("..") {
            return Err(DispatchError::validation(
                "script",
                format!("'{name}' is not a plain script name"),
            ));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self, extension: &str) -> PathBuf {
        PathBuf::from(format!("{}.{extension}", self.0))
    }
}

impl fmt::Display for ScriptName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A dependency category.
#[derive(Debug, Clone)]
pub enum PathPredicate {
    /// Anything below a directory with this name, and the directory itself.
    Under(String),
    /// Regex over the `/`-separated relative path.
    Matches(Regex),
}

impl PathPredicate {
    pub fn from_rule(rule: &DependencyRule) -> Result<Self> {
        match rule {
            DependencyRule::Under { under } => Ok(Self::Under(under.clone())),
            DependencyRule::Pattern { pattern } => Regex::new(pattern)
                .map(Self::Matches)
                .map_err(|e| DispatchError::validation("dependency pattern", e.to_string())),
        }
    }

    pub fn matches(&self, entry: &TreeEntry) -> bool {
        match self {
            Self::Under(dir) => {
                let names: Vec<&std::ffi::OsStr> = entry
                    .relative
                    .components()
                    .filter_map(|c| match c {
                        Component::Normal(n) => Some(n),
                        _ => None,
                    })
                    .collect();
                let Some((last, parents)) = names.split_last() else {
                    return false;
                };
                parents.iter().any(|n| *n == dir.as_str())
                    || (entry.kind == EntryKind::Dir && *last == dir.as_str())
            }
            Self::Matches(re) => re.is_match(&entry.slash_path()),
        }
    }
}

pub struct DependencyResolver {
    root: PathBuf,
    extension: String,
    predicates: Vec<PathPredicate>,
}

impl DependencyResolver {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>, predicates: Vec<PathPredicate>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
            predicates,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Entries to bundle for `script`, root first. `NotFound` when the
    /// script has no backing file.
    pub fn resolve(&self, tree: &dyn FileTree, script: &ScriptName) -> Result<Vec<TreeEntry>> {
        let script_file = script.file_name(&self.extension);
        let script_path = self.root.join(&script_file);
        if !tree.exists(&script_path) {
            return Err(DispatchError::not_found("script", script.as_str()));
        }

        let is_script = |entry: &TreeEntry| entry.kind == EntryKind::File && entry.relative == script_file;
        let selected: Vec<TreeEntry> = tree
            .list_tree(&self.root)?
            .into_iter()
            .filter(|entry| {
                entry.is_root() || is_script(entry) || self.predicates.iter().any(|p| p.matches(entry))
            })
            .collect();

        // A directory named like the script is not a script.
        if !selected.iter().any(is_script) {
            return Err(DispatchError::not_found("script", script.as_str()));
        }

        tracing::debug!(
            %script,
            entries = selected.len(),
            "resolved script dependencies"
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packaging::fs::LocalFileTree;
    use std::fs;

    fn entry(path: &str, kind: EntryKind) -> TreeEntry {
        TreeEntry {
            relative: PathBuf::from(path),
            kind,
        }
    }

    #[test]
    fn test_script_name_strips_extension() {
        assert_eq!(ScriptName::parse("pingtest.py", "py").unwrap().as_str(), "pingtest");
        assert_eq!(ScriptName::parse("pingtest", "py").unwrap().as_str(), "pingtest");
    }

    #[test]
    fn test_script_name_rejects_traversal() {
        for bad in ["", ".py", "../etc/passwd", "a/b", "a\\b", ".hidden", "x..y"] {
            assert!(
                matches!(ScriptName::parse(bad, "py"), Err(DispatchError::Validation { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_under_predicate() {
        let p = PathPredicate::Under("customtestlibs".into());
        assert!(p.matches(&entry("customtestlibs", EntryKind::Dir)));
        assert!(p.matches(&entry("customtestlibs/wifi_test.py", EntryKind::File)));
        assert!(p.matches(&entry("customtestlibs/routers/router_base.py", EntryKind::File)));
        assert!(p.matches(&entry("vendor/customtestlibs/x.py", EntryKind::File)));
        assert!(!p.matches(&entry("customtestlibs.py", EntryKind::File)));
        assert!(!p.matches(&entry("crawlertest.py", EntryKind::File)));
        assert!(!p.matches(&entry("", EntryKind::Dir)));
    }

    #[test]
    fn test_pattern_predicate_uses_slash_paths() {
        let p = PathPredicate::from_rule(&DependencyRule::Pattern {
            pattern: r"^resources/.*\.robot$".into(),
        })
        .unwrap();
        assert!(p.matches(&entry("resources/common.robot", EntryKind::File)));
        assert!(!p.matches(&entry("other/resources/common.robot", EntryKind::File)));
    }

    #[test]
    fn test_bad_pattern_is_validation_error() {
        let err = PathPredicate::from_rule(&DependencyRule::Pattern {
            pattern: "(".into(),
        })
        .unwrap_err();
        assert!(matches!(err, DispatchError::Validation { .. }));
    }

    #[test]
    fn test_resolve_selects_script_and_libs_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("customtestlibs")).unwrap();
        fs::write(root.join("customtestlibs/http_helpers.py"), "").unwrap();
        fs::write(root.join("login_flow.py"), "").unwrap();
        fs::write(root.join("other_suite.py"), "").unwrap();

        let resolver = DependencyResolver::new(
            root,
            "py",
            vec![PathPredicate::Under("customtestlibs".into())],
        );
        let script = ScriptName::parse("login_flow", "py").unwrap();
        let picked: Vec<String> = resolver
            .resolve(&LocalFileTree, &script)
            .unwrap()
            .iter()
            .map(TreeEntry::slash_path)
            .collect();

        assert_eq!(
            picked,
            vec!["", "customtestlibs", "customtestlibs/http_helpers.py", "login_flow.py"]
        );
    }

    #[test]
    fn test_resolve_missing_script_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DependencyResolver::new(dir.path(), "py", Vec::new());
        let script = ScriptName::parse("ghost", "py").unwrap();
        let err = resolver.resolve(&LocalFileTree, &script).unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { entity: "script", .. }));
    }

    #[test]
    fn test_script_in_subdirectory_is_not_the_target() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("archive")).unwrap();
        fs::write(dir.path().join("archive/pingtest.py"), "").unwrap();
        fs::write(dir.path().join("pingtest.py"), "").unwrap();

        let resolver = DependencyResolver::new(dir.path(), "py", Vec::new());
        let script = ScriptName::parse("pingtest", "py").unwrap();
        let picked: Vec<String> = resolver
            .resolve(&LocalFileTree, &script)
            .unwrap()
            .iter()
            .map(TreeEntry::slash_path)
            .collect();
        assert_eq!(picked, vec!["", "pingtest.py"]);
    }
}
