//! [`DocumentRepository`] over the SQLite `documents` table.
//!
//! Each call checks a connection out of the r2d2 pool on the blocking thread
//! pool and is bounded by the configured operation timeout. Every mutation is
//! a single SQL statement, so SQLite's write lock makes it atomic, and a call
//! that reports an error has not written anything.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use uuid::Uuid;

use super::repository::{Document, DocumentRepository, Filter, Stored};
use super::Pool;
use crate::error::{DispatchError, Result};

#[derive(Clone)]
pub struct SqliteRepository {
    pool: Pool,
    timeout: Duration,
}

impl SqliteRepository {
    pub fn new(pool: Pool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Run `f` on the blocking pool within the operation budget.
    ///
    /// The budget is enforced inside the job: pool checkout and SQLite's busy
    /// wait are both capped by what is left of it. An error returned from
    /// here therefore means the statement did not commit.
    async fn run<R, F>(&self, op: &'static str, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
    {
        let pool = self.pool.clone();
        let budget = self.timeout;
        let deadline = Instant::now() + budget;

        let job = tokio::task::spawn_blocking(move || {
            let conn = pool.get_timeout(remaining(op, deadline, budget)?)?;
            conn.busy_timeout(remaining(op, deadline, budget)?)?;
            f(&conn)
        });

        let result = job.await.unwrap_or_else(|join| {
            Err(DispatchError::StoreUnavailable(format!("{op} aborted: {join}")))
        });
        if let Err(DispatchError::StoreUnavailable(reason)) = &result {
            tracing::warn!(op, ?budget, %reason, "store call failed");
        }
        result
    }
}

/// Time left before `deadline`; `StoreUnavailable` once it has passed.
fn remaining(op: &str, deadline: Instant, budget: Duration) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(DispatchError::StoreUnavailable(format!(
            "{op} timed out after {budget:?}"
        )));
    }
    Ok(left)
}

/// Render `filter` as a WHERE clause over `collection`, appending bind values.
fn where_clause(collection: &str, filter: &Filter, binds: &mut Vec<SqlValue>) -> Result<String> {
    let mut sql = String::from("collection = ?");
    binds.push(SqlValue::Text(collection.to_string()));

    if let Some(key) = &filter.key {
        sql.push_str(" AND doc_key = ?");
        binds.push(SqlValue::Text(key.clone()));
    }
    if let Some(version) = filter.version {
        sql.push_str(" AND version = ?");
        binds.push(SqlValue::Integer(version));
    }
    for (name, value) in &filter.fields {
        let path = SqlValue::Text(format!("$.{name}"));
        match value {
            serde_json::Value::Null => {
                sql.push_str(" AND json_extract(body, ?) IS NULL");
                binds.push(path);
            }
            serde_json::Value::Bool(b) => {
                sql.push_str(" AND json_extract(body, ?) = ?");
                binds.push(path);
                binds.push(SqlValue::Integer(i64::from(*b)));
            }
            serde_json::Value::Number(n) => {
                sql.push_str(" AND json_extract(body, ?) = ?");
                binds.push(path);
                binds.push(match n.as_i64() {
                    Some(i) => SqlValue::Integer(i),
                    None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
                });
            }
            serde_json::Value::String(s) => {
                sql.push_str(" AND json_extract(body, ?) = ?");
                binds.push(path);
                binds.push(SqlValue::Text(s.clone()));
            }
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                return Err(DispatchError::validation(
                    "filter",
                    format!("field '{name}' must be compared against a scalar"),
                ));
            }
        }
    }
    Ok(sql)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn select<T: Document>(
    conn: &Connection,
    filter: &Filter,
    limit: Option<usize>,
) -> Result<Vec<Stored<T>>> {
    let mut binds = Vec::new();
    let mut sql = format!(
        "SELECT id, version, body FROM documents WHERE {} ORDER BY doc_key",
        where_clause(T::COLLECTION, filter, &mut binds)?
    );
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {n}"));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(binds), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut out = Vec::new();
    for r in rows {
        let (id, version, body) = r?;
        let id = Uuid::parse_str(&id)
            .map_err(|e| DispatchError::StoreUnavailable(format!("corrupt document id {id}: {e}")))?;
        out.push(Stored {
            id,
            version,
            doc: serde_json::from_str(&body)?,
        });
    }
    Ok(out)
}

#[async_trait]
impl DocumentRepository for SqliteRepository {
    async fn insert<T: Document>(&self, doc: &T) -> Result<Stored<T>> {
        let body = serde_json::to_string(doc)?;
        let key = doc.key();
        let id = Uuid::new_v4();

        self.run("insert", move |conn| {
            let now = Utc::now().to_rfc3339();
            let res = conn.execute(
                "INSERT INTO documents (id, collection, doc_key, version, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)",
                rusqlite::params![id.to_string(), T::COLLECTION, key, body, now],
            );
            match res {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(DispatchError::conflict(T::ENTITY, key)),
                Err(e) => Err(e.into()),
            }
        })
        .await?;

        Ok(Stored {
            id,
            version: 1,
            doc: doc.clone(),
        })
    }

    async fn find_one<T: Document>(&self, filter: Filter) -> Result<Option<Stored<T>>> {
        self.run("find_one", move |conn| {
            Ok(select::<T>(conn, &filter, Some(1))?.into_iter().next())
        })
        .await
    }

    async fn find<T: Document>(&self, filter: Filter) -> Result<Vec<Stored<T>>> {
        self.run("find", move |conn| select::<T>(conn, &filter, None))
            .await
    }

    async fn conditional_update<T: Document>(&self, filter: Filter, doc: &T) -> Result<bool> {
        let body = serde_json::to_string(doc)?;
        let key = doc.key();

        self.run("conditional_update", move |conn| {
            let mut binds = vec![
                SqlValue::Text(body),
                SqlValue::Text(key.clone()),
                SqlValue::Text(Utc::now().to_rfc3339()),
            ];
            let clause = where_clause(T::COLLECTION, &filter, &mut binds)?;
            let sql = format!(
                "UPDATE documents SET body = ?, doc_key = ?, version = version + 1, updated_at = ?
                 WHERE id = (SELECT id FROM documents WHERE {clause} ORDER BY doc_key LIMIT 1)"
            );
            match conn.execute(&sql, params_from_iter(binds)) {
                Ok(changed) => Ok(changed == 1),
                Err(e) if is_unique_violation(&e) => Err(DispatchError::conflict(T::ENTITY, key)),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::model::{EndpointQueue, Priority, Task, TaskStatus, TestSuite};

    fn repo() -> (tempfile::TempDir, SqliteRepository) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StorageConfig {
            database_path: dir.path().join("docs.db"),
            ..Default::default()
        };
        let pool = crate::storage::open_pool(&cfg).unwrap();
        (dir, SqliteRepository::new(pool, cfg.operation_timeout()))
    }

    #[tokio::test]
    async fn test_insert_then_find_by_key() {
        let (_dir, repo) = repo();
        let suite = TestSuite::new("login_flow").unwrap();
        let stored = repo.insert(&suite).await.unwrap();
        assert_eq!(stored.version, 1);

        let found = repo
            .find_one::<TestSuite>(Filter::key("login_flow"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, stored.id);
        assert_eq!(found.doc, suite);
    }

    #[tokio::test]
    async fn test_duplicate_key_is_conflict() {
        let (_dir, repo) = repo();
        repo.insert(&EndpointQueue::new("h:1")).await.unwrap();
        let err = repo.insert(&EndpointQueue::new("h:1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Conflict { entity: "endpoint queue", .. }));
    }

    #[tokio::test]
    async fn test_same_key_in_other_collection_is_allowed() {
        let (_dir, repo) = repo();
        repo.insert(&EndpointQueue::new("shared")).await.unwrap();
        repo.insert(&TestSuite::new("shared").unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_find_orders_by_key() {
        let (_dir, repo) = repo();
        for name in ["wifi_basic", "iperf", "login_flow"] {
            repo.insert(&TestSuite::new(name).unwrap()).await.unwrap();
        }
        let names: Vec<String> = repo
            .find::<TestSuite>(Filter::all())
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.doc.test_suite)
            .collect();
        assert_eq!(names, vec!["iperf", "login_flow", "wifi_basic"]);
    }

    #[tokio::test]
    async fn test_field_filter_on_status() {
        let (_dir, repo) = repo();
        let pending = Task::new("a", "h:1", Priority::HIGH);
        let mut running = Task::new("b", "h:1", Priority::HIGH);
        running.start("h:1").unwrap();
        repo.insert(&pending).await.unwrap();
        repo.insert(&running).await.unwrap();

        let found = repo
            .find::<Task>(Filter::all().field("status", TaskStatus::Running.as_str()))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].doc.id, running.id);

        let by_priority = repo
            .find::<Task>(Filter::all().field("priority", 1))
            .await
            .unwrap();
        assert_eq!(by_priority.len(), 2);
    }

    #[tokio::test]
    async fn test_conditional_update_pins_version() {
        let (_dir, repo) = repo();
        let mut q = EndpointQueue::new("h:1");
        let stored = repo.insert(&q).await.unwrap();

        q.push(Priority::HIGH, Uuid::new_v4());
        let filter = Filter::key("h:1").version(stored.version);
        assert!(repo.conditional_update(filter.clone(), &q).await.unwrap());

        // Same precondition again: version has moved on.
        assert!(!repo.conditional_update(filter, &q).await.unwrap());

        let now = repo
            .find_one::<EndpointQueue>(Filter::key("h:1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(now.version, 2);
        assert_eq!(now.doc.len(), 1);
    }

    #[tokio::test]
    async fn test_update_of_missing_record_reports_false() {
        let (_dir, repo) = repo();
        let q = EndpointQueue::new("nowhere:1");
        assert!(!repo
            .conditional_update(Filter::key("nowhere:1"), &q)
            .await
            .unwrap());
    }

    /// Hold SQLite's write lock from another connection for `hold`.
    fn hold_write_lock(path: std::path::PathBuf, hold: Duration) -> std::thread::JoinHandle<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let conn = Connection::open(path).unwrap();
            conn.execute_batch("BEGIN IMMEDIATE").unwrap();
            tx.send(()).unwrap();
            std::thread::sleep(hold);
            conn.execute_batch("COMMIT").unwrap();
        });
        rx.recv().unwrap();
        holder
    }

    #[tokio::test]
    async fn test_locked_write_fails_without_committing_later() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StorageConfig {
            database_path: dir.path().join("locked.db"),
            ..Default::default()
        };
        let pool = crate::storage::open_pool(&cfg).unwrap();
        let repo = SqliteRepository::new(pool, Duration::from_millis(100));

        let q = EndpointQueue::new("h:1");
        let stored = repo.insert(&q).await.unwrap();
        let mut changed = q.clone();
        changed.push(Priority::HIGH, Uuid::new_v4());

        let holder = hold_write_lock(cfg.database_path.clone(), Duration::from_millis(600));
        let err = repo
            .conditional_update(Filter::key("h:1").version(stored.version), &changed)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::StoreUnavailable(_)));

        // Reads are not blocked by the writer in WAL mode.
        let during = repo.find_one::<EndpointQueue>(Filter::key("h:1")).await.unwrap().unwrap();
        assert_eq!(during.version, 1);

        holder.join().unwrap();
        let after = repo.find_one::<EndpointQueue>(Filter::key("h:1")).await.unwrap().unwrap();
        assert_eq!(after.version, 1);
        assert!(after.doc.is_empty());
    }

    #[tokio::test]
    async fn test_non_scalar_filter_is_rejected() {
        let (_dir, repo) = repo();
        let err = repo
            .find::<Task>(Filter::all().field("endpoint_list", serde_json::json!(["h:1"])))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation { field: "filter", .. }));
    }
}
