use agenda_protocol::model::Period;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use thiserror::Error;
use tokio::sync::RwLock;

pub const SCHEDULE_PREFIX: &str = "schedule:";
pub const USER_PREFIX: &str = "user:";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// String key/value cache for derived schedules and requester records.
#[async_trait]
pub trait Cache: Send + Sync {
    /// `Ok(None)` means no entry.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String) -> Result<(), CacheError>;

    /// Drops every key starting with `prefix`, returning how many went.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
}

pub fn schedule_key(period: &Period) -> String {
    format!(
        "{SCHEDULE_PREFIX}{}-{}",
        period.start.to_rfc3339(),
        period.end.to_rfc3339()
    )
}

pub fn user_key(addr: &IpAddr) -> String {
    format!("{USER_PREFIX}{addr}")
}

/// In-process cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), CacheError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }
}
