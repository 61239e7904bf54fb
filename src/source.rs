use crate::catalog::types::Record;
use crate::error::SyncError;
use async_trait::async_trait;

/// Result of one backend page query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageLoad {
    pub records: Vec<Record>,
    pub total_count: u64,
}

/// Backend pagination/query API for one table.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        table_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<PageLoad, SyncError>;

    /// Authoritative row count, used to correct incremental drift.
    async fn fetch_total_count(&self, table_id: &str) -> Result<u64, SyncError>;
}
