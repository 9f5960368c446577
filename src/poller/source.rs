use anyhow::Result;
use async_trait::async_trait;
use data_model::SourceComment;

/// An issue (or pull request) from an external tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub author: String,
    pub url: String,
    pub updated_at: u64,
}

/// An external tracker the poller scans for command lines.
#[async_trait]
pub trait TriggerSource: Send + Sync {
    /// Stable name used in instance keys, e.g. `owner/repo`.
    fn name(&self) -> &str;

    async fn list_updated_items(&self, since_ms: u64) -> Result<Vec<SourceItem>>;

    async fn list_comments(&self, item_number: u64) -> Result<Vec<SourceComment>>;

    async fn create_comment(&self, item_number: u64, body: &str) -> Result<()>;
}
