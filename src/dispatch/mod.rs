//! Dispatch coordinator: per-endpoint priority queues with at-most-once
//! claim semantics.
//!
//! Each endpoint owns one [`EndpointQueue`] record. Provisioning is a single
//! insert, so it either creates all three priority lanes or none. Enqueue and
//! claim are read, modify, then a conditional update pinned to the version
//! that was read; a lost race re-reads and tries again.

mod submit;

pub use self::submit::RunRequest;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::model::{normalize_endpoint, EndpointQueue, Outcome, Priority, Task, TaskStatus};
use crate::storage::{Document, DocumentRepository, Filter, Stored};

/// Queue contents for one endpoint, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSummary {
    pub endpoint_address: String,
    pub lanes: Vec<LaneSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneSummary {
    pub priority: Priority,
    pub tasks: Vec<Uuid>,
}

impl From<&EndpointQueue> for QueueSummary {
    fn from(q: &EndpointQueue) -> Self {
        Self {
            endpoint_address: q.endpoint_address.clone(),
            lanes: Priority::ALL
                .into_iter()
                .map(|priority| LaneSummary {
                    priority,
                    tasks: q.lane(priority).iter().copied().collect(),
                })
                .collect(),
        }
    }
}

pub struct Dispatcher<R> {
    repo: Arc<R>,
    max_retries: u32,
}

impl<R> Clone for Dispatcher<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            max_retries: self.max_retries,
        }
    }
}

impl<R: DocumentRepository> Dispatcher<R> {
    pub fn new(repo: Arc<R>, max_retries: u32) -> Self {
        Self {
            repo,
            max_retries: max_retries.max(1),
        }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Create the priority 1..=3 queues for `endpoint` in one step.
    /// `Conflict` if the endpoint already has them.
    pub async fn provision(&self, endpoint: &str) -> Result<EndpointQueue> {
        let endpoint = normalize_endpoint(endpoint)?;
        let queue = EndpointQueue::new(&endpoint);
        match self.repo.insert(&queue).await {
            Ok(stored) => {
                info!(endpoint = %endpoint, "provisioned endpoint queues");
                Ok(stored.doc)
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "provisioning failed");
                Err(e)
            }
        }
    }

    /// Append `task_id` to the tail of `endpoint`'s `priority` lane.
    pub async fn enqueue(&self, task_id: Uuid, endpoint: &str, priority: Priority) -> Result<()> {
        let endpoint = normalize_endpoint(endpoint)?;

        for attempt in 1..=self.max_retries {
            let stored = self.load_queue(&endpoint).await?;
            let mut queue = stored.doc;
            queue.push(priority, task_id);

            let filter = Filter::key(&endpoint).version(stored.version);
            if self.repo.conditional_update(filter, &queue).await? {
                info!(
                    endpoint = %endpoint,
                    task = %task_id,
                    priority = priority.level(),
                    depth = queue.lane(priority).len(),
                    "task enqueued"
                );
                return Ok(());
            }
            debug!(endpoint = %endpoint, attempt, "enqueue lost update race, retrying");
        }

        Err(self.contention(&endpoint))
    }

    /// Take the next task for `endpoint`: head of the lowest-numbered
    /// non-empty lane, moved to Running. `Ok(None)` when all lanes are empty.
    ///
    /// Ownership is decided by the Pending -> Running update on the task, so
    /// only one caller can win it. The queue entry is removed afterwards; an
    /// entry whose task is no longer Pending is dropped by whoever sees it.
    /// A failed claim leaves both the task and the queue untouched.
    pub async fn claim(&self, endpoint: &str) -> Result<Option<Task>> {
        let endpoint = normalize_endpoint(endpoint)?;

        loop {
            let queue = self.load_queue(&endpoint).await?.doc;
            let Some((priority, task_id)) = queue.peek_next() else {
                debug!(endpoint = %endpoint, "no task available");
                return Ok(None);
            };

            match self.start_task(task_id, &endpoint).await? {
                Some(task) => {
                    if let Err(e) = self.dequeue(&endpoint, priority, task_id).await {
                        // The task is Running; the stale entry is dropped by the next claim.
                        warn!(endpoint = %endpoint, task = %task_id, error = %e, "claimed task left in queue");
                    }
                    info!(
                        endpoint = %endpoint,
                        task = %task.id,
                        suite = %task.test_suite,
                        priority = priority.level(),
                        "task claimed"
                    );
                    return Ok(Some(task));
                }
                None => {
                    debug!(endpoint = %endpoint, task = %task_id, "dropping queue entry for task that is not pending");
                    self.dequeue(&endpoint, priority, task_id).await?;
                }
            }
        }
    }

    /// Running -> Completed/Failed on a worker's report.
    pub async fn complete(&self, task_id: Uuid, outcome: Outcome) -> Result<Task> {
        for attempt in 1..=self.max_retries {
            let stored = self
                .repo
                .find_one::<Task>(Filter::key(task_id.to_string()))
                .await?
                .ok_or_else(|| DispatchError::not_found("task", task_id.to_string()))?;
            let mut task = stored.doc;
            task.finish(outcome)?;

            let filter = Filter::key(task_id.to_string())
                .version(stored.version)
                .field("status", TaskStatus::Running.as_str());
            if self.repo.conditional_update(filter, &task).await? {
                info!(task = %task_id, status = %task.status, "task finished");
                return Ok(task);
            }
            debug!(task = %task_id, attempt, "completion lost update race, retrying");
        }
        Err(DispatchError::StoreUnavailable(format!(
            "task {task_id} kept changing during completion"
        )))
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task> {
        self.repo
            .find_one::<Task>(Filter::key(task_id.to_string()))
            .await?
            .map(|s| s.doc)
            .ok_or_else(|| DispatchError::not_found("task", task_id.to_string()))
    }

    pub async fn list_queues(&self) -> Result<Vec<QueueSummary>> {
        Ok(self
            .repo
            .find::<EndpointQueue>(Filter::all())
            .await?
            .iter()
            .map(|s| QueueSummary::from(&s.doc))
            .collect())
    }

    async fn load_queue(&self, endpoint: &str) -> Result<Stored<EndpointQueue>> {
        self.repo
            .find_one::<EndpointQueue>(Filter::key(endpoint))
            .await?
            .ok_or_else(|| DispatchError::not_found(EndpointQueue::ENTITY, endpoint))
    }

    /// Pending -> Running. `Ok(None)` when the task is gone or no longer pending.
    async fn start_task(&self, task_id: Uuid, endpoint: &str) -> Result<Option<Task>> {
        for _ in 0..self.max_retries {
            let Some(stored) = self
                .repo
                .find_one::<Task>(Filter::key(task_id.to_string()))
                .await?
            else {
                return Ok(None);
            };
            let mut task = stored.doc;
            if task.status != TaskStatus::Pending {
                return Ok(None);
            }
            task.start(endpoint)?;

            let filter = Filter::key(task_id.to_string())
                .version(stored.version)
                .field("status", TaskStatus::Pending.as_str());
            if self.repo.conditional_update(filter, &task).await? {
                return Ok(Some(task));
            }
        }
        Err(DispatchError::StoreUnavailable(format!(
            "task {task_id} kept changing while being claimed"
        )))
    }

    /// Remove `task_id` from its lane. Already gone is fine.
    async fn dequeue(&self, endpoint: &str, priority: Priority, task_id: Uuid) -> Result<()> {
        for attempt in 1..=self.max_retries {
            let stored = self.load_queue(endpoint).await?;
            let mut queue = stored.doc;
            if !queue.remove(priority, task_id) {
                return Ok(());
            }
            let filter = Filter::key(endpoint).version(stored.version);
            if self.repo.conditional_update(filter, &queue).await? {
                return Ok(());
            }
            debug!(endpoint = %endpoint, attempt, "dequeue lost update race, retrying");
        }
        Err(self.contention(endpoint))
    }

    fn contention(&self, endpoint: &str) -> DispatchError {
        warn!(endpoint = %endpoint, retries = self.max_retries, "queue update kept losing races");
        DispatchError::StoreUnavailable(format!(
            "endpoint queue {endpoint} is too contended ({} attempts)",
            self.max_retries
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::{open_pool, SqliteRepository};

    fn dispatcher() -> (tempfile::TempDir, Dispatcher<SqliteRepository>) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StorageConfig {
            database_path: dir.path().join("dispatch.db"),
            ..Default::default()
        };
        let pool = open_pool(&cfg).unwrap();
        let repo = SqliteRepository::new(pool, cfg.operation_timeout());
        (dir, Dispatcher::new(Arc::new(repo), cfg.max_update_retries))
    }

    async fn pending_task(d: &Dispatcher<SqliteRepository>, endpoint: &str, priority: Priority) -> Task {
        let task = Task::new("login_flow", endpoint, priority);
        d.repository().insert(&task).await.unwrap();
        d.enqueue(task.id, endpoint, priority).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_provision_creates_three_empty_lanes() {
        let (_dir, d) = dispatcher();
        let q = d.provision("10.0.0.5:8270").await.unwrap();
        assert!(q.is_empty());

        let listed = d.list_queues().await.unwrap();
        assert_eq!(listed.len(), 1);
        let levels: Vec<u8> = listed[0].lanes.iter().map(|l| l.priority.level()).collect();
        assert_eq!(levels, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_provision_twice_conflicts_and_keeps_contents() {
        let (_dir, d) = dispatcher();
        d.provision("10.0.0.5:8270").await.unwrap();
        let task = pending_task(&d, "10.0.0.5:8270", Priority::NORMAL).await;

        let err = d.provision("10.0.0.5:8270").await.unwrap_err();
        assert!(matches!(err, DispatchError::Conflict { .. }));

        let listed = d.list_queues().await.unwrap();
        assert_eq!(listed[0].lanes[1].tasks, vec![task.id]);
    }

    #[tokio::test]
    async fn test_provision_rejects_empty_endpoint() {
        let (_dir, d) = dispatcher();
        let err = d.provision("  ").await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_enqueue_unprovisioned_is_not_found() {
        let (_dir, d) = dispatcher();
        let err = d
            .enqueue(Uuid::new_v4(), "10.0.0.9:8270", Priority::NORMAL)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { entity: "endpoint queue", .. }));
        assert!(d.list_queues().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_serves_priority_one_first() {
        let (_dir, d) = dispatcher();
        d.provision("10.0.0.5:8270").await.unwrap();
        let t1 = pending_task(&d, "10.0.0.5:8270", Priority::NORMAL).await;
        let t2 = pending_task(&d, "10.0.0.5:8270", Priority::HIGH).await;

        let first = d.claim("10.0.0.5:8270").await.unwrap().unwrap();
        assert_eq!(first.id, t2.id);
        assert_eq!(first.status, TaskStatus::Running);
        assert_eq!(first.endpoint_run.as_deref(), Some("10.0.0.5:8270"));

        let second = d.claim("10.0.0.5:8270").await.unwrap().unwrap();
        assert_eq!(second.id, t1.id);

        assert!(d.claim("10.0.0.5:8270").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_on_empty_queue_is_not_an_error() {
        let (_dir, d) = dispatcher();
        d.provision("10.0.0.5:8270").await.unwrap();
        assert!(d.claim("10.0.0.5:8270").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_unprovisioned_is_not_found() {
        let (_dir, d) = dispatcher();
        let err = d.claim("10.0.0.5:8270").await.unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_claim_skips_tasks_that_are_no_longer_pending() {
        let (_dir, d) = dispatcher();
        d.provision("h:1").await.unwrap();
        let stale = pending_task(&d, "h:1", Priority::HIGH).await;
        let live = pending_task(&d, "h:1", Priority::HIGH).await;

        // Someone else already moved the first task along.
        let mut moved = stale.clone();
        moved.start("elsewhere:1").unwrap();
        d.repository()
            .conditional_update(Filter::key(stale.id.to_string()), &moved)
            .await
            .unwrap();

        let claimed = d.claim("h:1").await.unwrap().unwrap();
        assert_eq!(claimed.id, live.id);
        assert!(d.claim("h:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_removes_entry_and_keeps_the_rest() {
        let (_dir, d) = dispatcher();
        d.provision("h:1").await.unwrap();
        let first = pending_task(&d, "h:1", Priority::NORMAL).await;
        let second = pending_task(&d, "h:1", Priority::NORMAL).await;

        assert_eq!(d.claim("h:1").await.unwrap().unwrap().id, first.id);

        let listed = d.list_queues().await.unwrap();
        assert_eq!(listed[0].lanes[1].tasks, vec![second.id]);
        assert_eq!(d.get_task(second.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_complete_requires_running() {
        let (_dir, d) = dispatcher();
        d.provision("h:1").await.unwrap();
        let task = pending_task(&d, "h:1", Priority::LOW).await;

        let err = d.complete(task.id, Outcome::Completed).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation { field: "status", .. }));

        d.claim("h:1").await.unwrap().unwrap();
        let done = d.complete(task.id, Outcome::Completed).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.finish_date.is_some());
        assert_eq!(d.get_task(task.id).await.unwrap().status, TaskStatus::Completed);

        let missing = d.complete(Uuid::new_v4(), Outcome::Failed).await.unwrap_err();
        assert!(matches!(missing, DispatchError::NotFound { entity: "task", .. }));
    }
}
