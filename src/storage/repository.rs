//! Narrow document repository interface consumed by the dispatcher.
//!
//! Four operations only: insert, find-one, find, and a conditional update
//! that replaces exactly one matching record or nothing. Pinning `version`
//! in the filter turns the conditional update into compare-and-update.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;

/// A typed record with a unique identity inside its collection.
pub trait Document: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: &'static str;
    /// Human-readable kind, used in error messages.
    const ENTITY: &'static str;

    fn key(&self) -> String;
}

/// A record as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub id: Uuid,
    /// Bumped by every successful update.
    pub version: i64,
    pub doc: T,
}

/// Conjunction of equality predicates over one collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub(crate) key: Option<String>,
    pub(crate) version: Option<i64>,
    pub(crate) fields: Vec<(String, serde_json::Value)>,
}

impl Filter {
    /// Matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    /// Top-level body field equality. Only scalar values are supported.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Insert a new record. `Conflict` when the key is taken.
    async fn insert<T: Document>(&self, doc: &T) -> Result<Stored<T>>;

    async fn find_one<T: Document>(&self, filter: Filter) -> Result<Option<Stored<T>>>;

    /// All matching records, ordered by key.
    async fn find<T: Document>(&self, filter: Filter) -> Result<Vec<Stored<T>>>;

    /// Replace the body of the one record matching `filter`.
    /// Returns `false` when nothing matched.
    async fn conditional_update<T: Document>(&self, filter: Filter, doc: &T) -> Result<bool>;
}
