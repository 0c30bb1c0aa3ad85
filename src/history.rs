//! Per-function execution history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::request::{ExecutionResponse, Profile};

/// One recorded execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub function_id: i64,
    pub profile: Profile,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub response: ExecutionResponse,
}

/// Trait for execution-history stores.
#[async_trait]
pub trait MetricsHistory: Send + Sync {
    /// Store `response`, stamped with the current time.
    async fn record(
        &self,
        function_id: i64,
        profile: Profile,
        response: &ExecutionResponse,
    ) -> HistoryEntry;

    /// Entries for `function_id` within the inclusive bounds, oldest first.
    async fn range(
        &self,
        function_id: i64,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<HistoryEntry>;
}

/// Process-local history.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    entries: RwLock<Vec<HistoryEntry>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a pre-stamped entry.
    pub async fn insert(&self, entry: HistoryEntry) {
        self.entries.write().await.push(entry);
    }
}

#[async_trait]
impl MetricsHistory for InMemoryHistory {
    async fn record(
        &self,
        function_id: i64,
        profile: Profile,
        response: &ExecutionResponse,
    ) -> HistoryEntry {
        let entry = HistoryEntry {
            function_id,
            profile,
            recorded_at: Utc::now(),
            response: response.clone(),
        };
        self.insert(entry.clone()).await;
        entry
    }

    async fn range(
        &self,
        function_id: i64,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<HistoryEntry> {
        let mut matching: Vec<HistoryEntry> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.function_id == function_id)
            .filter(|e| since.map_or(true, |s| e.recorded_at >= s))
            .filter(|e| until.map_or(true, |u| e.recorded_at <= u))
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.recorded_at);
        matching
    }
}
