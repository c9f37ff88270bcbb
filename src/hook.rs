use crate::errors::Result;
use async_trait::async_trait;

/// Marks a permanent record as printed in the external record store.
///
/// Implementations must be idempotent: the task runner may call this again for
/// a record that is already flagged.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn mark_printed(&self, tenant: &str, record_id: &str) -> Result<()>;
}
