//! Run submission and test suite bookkeeping.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{error, info};
use uuid::Uuid;

use super::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::model::{normalize_endpoint, Priority, Task, TestSuite, TestSuitePatch};
use crate::storage::{DocumentRepository, Filter};

/// Body of a run request against one suite.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    pub endpoint: String,
    /// 1..=3, defaults to 2.
    pub priority: Option<u8>,
    /// Subset of the suite's cases; all of them when absent.
    pub test_cases: Option<Vec<String>>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    pub tester: Option<String>,
}

impl RunRequest {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }
}

impl<R: DocumentRepository> Dispatcher<R> {
    /// Create a Pending task for `suite` and queue it on the requested
    /// endpoint. Returns the new task id.
    pub async fn submit_run(&self, suite: &str, req: RunRequest) -> Result<Uuid> {
        let priority = req.priority.map(Priority::new).transpose()?.unwrap_or_default();
        let endpoint = normalize_endpoint(&req.endpoint)?;

        let suite = self
            .repo
            .find_one::<TestSuite>(Filter::key(suite.trim()))
            .await?
            .ok_or_else(|| DispatchError::not_found("test suite", suite.trim()))?
            .doc;

        let mut task = Task::new(&suite.test_suite, &endpoint, priority);
        task.test_cases = req.test_cases.unwrap_or_else(|| suite.test_cases.clone());
        task.variables = req.variables;
        task.tester = req.tester;

        let stored = self.repo.insert(&task).await?;

        if let Err(e) = self.enqueue(task.id, &endpoint, priority).await {
            // Leave no Pending task behind that no queue will ever hand out.
            let mut dead = stored.doc;
            dead.abandon();
            let filter = Filter::key(task.id.to_string()).version(stored.version);
            if let Err(mark) = self.repo.conditional_update(filter, &dead).await {
                error!(task = %task.id, error = %mark, "failed to mark unqueued task as failed");
            }
            return Err(e);
        }

        info!(
            task = %task.id,
            suite = %suite.test_suite,
            endpoint = %endpoint,
            priority = priority.level(),
            "run submitted"
        );
        Ok(task.id)
    }

    /// Suite identifiers, ordered.
    pub async fn list_suites(&self) -> Result<Vec<String>> {
        Ok(self
            .repo
            .find::<TestSuite>(Filter::all())
            .await?
            .into_iter()
            .map(|s| s.doc.test_suite)
            .collect())
    }

    pub async fn get_suite(&self, name: &str) -> Result<TestSuite> {
        self.repo
            .find_one::<TestSuite>(Filter::key(name.trim()))
            .await?
            .map(|s| s.doc)
            .ok_or_else(|| DispatchError::not_found("test suite", name.trim()))
    }

    /// Store a new suite. `Conflict` when the name is taken.
    pub async fn register_suite(&self, suite: TestSuite) -> Result<TestSuite> {
        let stored = self.repo.insert(&suite).await?;
        info!(suite = %stored.doc.test_suite, "test suite registered");
        Ok(stored.doc)
    }

    pub async fn patch_suite(&self, name: &str, patch: TestSuitePatch) -> Result<TestSuite> {
        if patch.is_empty() {
            return Err(DispatchError::validation("patch", "no fields to update"));
        }
        let name = name.trim();

        for _ in 0..self.max_retries {
            let stored = self
                .repo
                .find_one::<TestSuite>(Filter::key(name))
                .await?
                .ok_or_else(|| DispatchError::not_found("test suite", name))?;
            let mut suite = stored.doc;
            patch.clone().apply(&mut suite)?;

            let filter = Filter::key(name).version(stored.version);
            if self.repo.conditional_update(filter, &suite).await? {
                info!(suite = %name, "test suite updated");
                return Ok(suite);
            }
        }
        Err(DispatchError::StoreUnavailable(format!(
            "test suite {name} kept changing during update"
        )))
    }
}
