mod sqlite;

pub use sqlite::SqliteStorage;

use agenda_protocol::model::{Availability, Task, TaskUpdate, Visitor};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("deadline passed before the change was applied")]
    Expired,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Persistent task and availability store.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Tasks with `start >= start` and `end <= end`, ordered by start.
    async fn fetch_tasks_in_range(
        &self,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Result<Vec<Task>, StoreError>;

    /// Availability rows currently flagged newest.
    async fn fetch_newest_availability(&self) -> Result<Vec<Availability>, StoreError>;

    async fn fetch_task(&self, tid: &str) -> Result<Task, StoreError>;

    // Mutations take the event deadline and fail with `Expired` instead of
    // writing once it has passed.

    async fn insert_task(&self, task: &Task, deadline: Instant) -> Result<(), StoreError>;

    /// Applies `update` and returns the stored task.
    async fn update_task(
        &self,
        tid: &str,
        update: &TaskUpdate,
        deadline: Instant,
    ) -> Result<Task, StoreError>;

    /// Number of rows removed; zero when the task was already gone.
    async fn delete_task(&self, tid: &str, deadline: Instant) -> Result<u64, StoreError>;

    /// Count one visit from `address`, creating the visitor on first sight.
    async fn record_visit(&self, uid: &str, address: &str) -> Result<Visitor, StoreError>;

    /// Flag the visitor with `uid` as having booked a task.
    async fn mark_visitor_booked(&self, uid: &str) -> Result<(), StoreError>;
}
