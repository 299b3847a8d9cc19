//! Test suite records and their allow-listed mutation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::storage::Document;

const MAX_PATH_LEN: usize = 300;
const MAX_AUTHOR_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSuite {
    /// Unique identity; fixed after creation.
    pub test_suite: String,
    #[serde(default)]
    pub test_cases: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    pub path: Option<String>,
    pub author: Option<String>,
    pub create_date: DateTime<Utc>,
    pub update_date: DateTime<Utc>,
}

impl TestSuite {
    pub fn new(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DispatchError::validation("test_suite", "must not be empty"));
        }
        let now = Utc::now();
        Ok(Self {
            test_suite: name.to_string(),
            test_cases: Vec::new(),
            parameters: BTreeMap::new(),
            path: None,
            author: None,
            create_date: now,
            update_date: now,
        })
    }
}

impl Document for TestSuite {
    const COLLECTION: &'static str = "test_suites";
    const ENTITY: &'static str = "test suite";

    fn key(&self) -> String {
        self.test_suite.clone()
    }
}

/// The fields a caller may change on an existing suite.
///
/// Identity and timestamps are not listed; a body naming them (or anything
/// else) fails to deserialize.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestSuitePatch {
    pub test_cases: Option<Vec<String>>,
    pub parameters: Option<BTreeMap<String, String>>,
    pub path: Option<String>,
    pub author: Option<String>,
}

impl TestSuitePatch {
    pub fn is_empty(&self) -> bool {
        self.test_cases.is_none()
            && self.parameters.is_none()
            && self.path.is_none()
            && self.author.is_none()
    }

    /// Apply to `suite`, bumping `update_date`. Nothing changes on error.
    pub fn apply(self, suite: &mut TestSuite) -> Result<()> {
        if let Some(path) = &self.path {
            if path.len() > MAX_PATH_LEN {
                return Err(DispatchError::validation(
                    "path",
                    format!("longer than {MAX_PATH_LEN} characters"),
                ));
            }
        }
        if let Some(author) = &self.author {
            if author.len() > MAX_AUTHOR_LEN {
                return Err(DispatchError::validation(
                    "author",
                    format!("longer than {MAX_AUTHOR_LEN} characters"),
                ));
            }
        }

        if let Some(cases) = self.test_cases {
            suite.test_cases = cases;
        }
        if let Some(params) = self.parameters {
            suite.parameters = params;
        }
        if self.path.is_some() {
            suite.path = self.path;
        }
        if self.author.is_some() {
            suite.author = self.author;
        }
        suite.update_date = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_trims_identity() {
        let suite = TestSuite::new("  login_flow \n").unwrap();
        assert_eq!(suite.test_suite, "login_flow");
        assert_eq!(suite.key(), "login_flow");
        assert!(TestSuite::new("   ").is_err());
    }

    #[test]
    fn test_patch_rejects_unknown_and_privileged_fields() {
        let unknown = serde_json::from_str::<TestSuitePatch>(r#"{"role": "admin"}"#);
        assert!(unknown.is_err());
        let identity = serde_json::from_str::<TestSuitePatch>(r#"{"test_suite": "other"}"#);
        assert!(identity.is_err());
        let dates = serde_json::from_str::<TestSuitePatch>(r#"{"create_date": "2020-01-01T00:00:00Z"}"#);
        assert!(dates.is_err());
    }

    #[test]
    fn test_patch_applies_listed_fields() {
        let mut suite = TestSuite::new("login_flow").unwrap();
        let before = suite.update_date;
        let patch: TestSuitePatch = serde_json::from_str(
            r#"{"test_cases": ["valid login", "bad password"], "author": "qa"}"#,
        )
        .unwrap();
        patch.apply(&mut suite).unwrap();

        assert_eq!(suite.test_cases.len(), 2);
        assert_eq!(suite.author.as_deref(), Some("qa"));
        assert!(suite.path.is_none());
        assert!(suite.update_date >= before);
    }

    #[test]
    fn test_patch_enforces_length_limits() {
        let mut suite = TestSuite::new("login_flow").unwrap();
        let patch = TestSuitePatch {
            author: Some("x".repeat(51)),
            test_cases: Some(vec!["kept out".into()]),
            ..Default::default()
        };
        assert!(patch.apply(&mut suite).is_err());
        assert!(suite.test_cases.is_empty());
    }
}
