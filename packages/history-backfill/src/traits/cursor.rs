//! Cursor store trait: durable key→value checkpoints.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::cursor::CursorKey;
use crate::types::record::RecordId;

/// Durable checkpoint storage, one key per (channel, direction).
///
/// Only per-key atomicity is required. Crawlers own disjoint keys, so
/// concurrent crawlers never contend on the same entry.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Read the stored cursor, `None` when the key was never written.
    async fn get(&self, key: &CursorKey) -> Result<Option<RecordId>>;

    /// Overwrite the cursor for `key`.
    async fn set(&self, key: &CursorKey, record_id: RecordId) -> Result<()>;
}

#[async_trait]
impl<T: CursorStore + ?Sized> CursorStore for Arc<T> {
    async fn get(&self, key: &CursorKey) -> Result<Option<RecordId>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &CursorKey, record_id: RecordId) -> Result<()> {
        (**self).set(key, record_id).await
    }
}
