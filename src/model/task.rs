//! A single run request against one test suite.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Priority;
use crate::error::{DispatchError, Result};
use crate::storage::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Value stored in the document body, for repository filters.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a worker reports a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
}

impl From<Outcome> for TaskStatus {
    fn from(o: Outcome) -> Self {
        match o {
            Outcome::Completed => TaskStatus::Completed,
            Outcome::Failed => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub test_suite: String,
    #[serde(default)]
    pub test_cases: Vec<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    pub status: TaskStatus,
    pub priority: Priority,
    pub start_date: DateTime<Utc>,
    pub run_date: Option<DateTime<Utc>>,
    pub finish_date: Option<DateTime<Utc>>,
    pub endpoint_list: Vec<String>,
    /// Endpoint that claimed the task.
    pub endpoint_run: Option<String>,
    pub tester: Option<String>,
}

impl Task {
    pub fn new(test_suite: impl Into<String>, endpoint: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            test_suite: test_suite.into(),
            test_cases: Vec::new(),
            variables: BTreeMap::new(),
            status: TaskStatus::Pending,
            priority,
            start_date: Utc::now(),
            run_date: None,
            finish_date: None,
            endpoint_list: vec![endpoint.into()],
            endpoint_run: None,
            tester: None,
        }
    }

    /// Pending -> Running, recording which endpoint took it.
    pub fn start(&mut self, endpoint: &str) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(self.bad_transition(TaskStatus::Running));
        }
        self.status = TaskStatus::Running;
        self.run_date = Some(Utc::now());
        self.endpoint_run = Some(endpoint.to_string());
        Ok(())
    }

    /// Running -> Completed | Failed.
    pub fn finish(&mut self, outcome: Outcome) -> Result<()> {
        let target = TaskStatus::from(outcome);
        if self.status != TaskStatus::Running {
            return Err(self.bad_transition(target));
        }
        self.status = target;
        self.finish_date = Some(Utc::now());
        Ok(())
    }

    /// Pending -> Failed, for a task that could not be queued.
    pub(crate) fn abandon(&mut self) {
        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::Failed;
            self.finish_date = Some(Utc::now());
        }
    }

    fn bad_transition(&self, target: TaskStatus) -> DispatchError {
        DispatchError::validation(
            "status",
            format!("task {} is {}, cannot move to {}", self.id, self.status, target),
        )
    }
}

impl Document for Task {
    const COLLECTION: &'static str = "tasks";
    const ENTITY: &'static str = "task";

    fn key(&self) -> String {
        self.id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new("login_flow", "10.0.0.5:8270", Priority::default());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::NORMAL);
        assert_eq!(task.endpoint_list, vec!["10.0.0.5:8270".to_string()]);
        assert!(task.run_date.is_none());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut task = Task::new("login_flow", "10.0.0.5:8270", Priority::HIGH);
        assert!(task.finish(Outcome::Completed).is_err());

        task.start("10.0.0.5:8270").unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.endpoint_run.as_deref(), Some("10.0.0.5:8270"));
        assert!(task.run_date.is_some());
        assert!(task.start("10.0.0.5:8270").is_err());

        task.finish(Outcome::Failed).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.finish(Outcome::Completed).is_err());
    }

    #[test]
    fn test_status_serializes_as_filter_value() {
        let v = serde_json::to_value(TaskStatus::Running).unwrap();
        assert_eq!(v, serde_json::json!(TaskStatus::Running.as_str()));
    }
}
