//! In-memory stores for testing and development.
//!
//! Not suitable for production: everything is lost on restart.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{PersistenceError, Result};
use crate::traits::cursor::CursorStore;
use crate::traits::sink::PersistenceSink;
use crate::types::cursor::CursorKey;
use crate::types::record::{ChannelId, Record, RecordId};

/// In-memory cursor store that also keeps a log of every write.
#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: RwLock<HashMap<CursorKey, RecordId>>,
    writes: RwLock<Vec<(CursorKey, RecordId)>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a cursor without logging it as a write.
    pub fn with_cursor(self, key: CursorKey, record_id: RecordId) -> Self {
        self.cursors.write().unwrap().insert(key, record_id);
        self
    }

    /// Every `set` call, in order.
    pub fn writes(&self) -> Vec<(CursorKey, RecordId)> {
        self.writes.read().unwrap().clone()
    }

    /// Writes made for one key, in order.
    pub fn writes_for(&self, key: &CursorKey) -> Vec<RecordId> {
        self.writes
            .read()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn clear(&self) {
        self.cursors.write().unwrap().clear();
        self.writes.write().unwrap().clear();
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, key: &CursorKey) -> Result<Option<RecordId>> {
        Ok(self.cursors.read().unwrap().get(key).copied())
    }

    async fn set(&self, key: &CursorKey, record_id: RecordId) -> Result<()> {
        self.cursors.write().unwrap().insert(*key, record_id);
        self.writes.write().unwrap().push((*key, record_id));
        Ok(())
    }
}

/// In-memory record sink keyed by record id.
///
/// Saving the same record twice overwrites it, so replays are harmless.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<RecordId, Record>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, record_id: RecordId) -> Option<Record> {
        self.records.read().unwrap().get(&record_id).cloned()
    }

    pub fn contains(&self, record_id: RecordId) -> bool {
        self.records.read().unwrap().contains_key(&record_id)
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored ids of one channel, ascending.
    pub fn ids_for_channel(&self, channel_id: ChannelId) -> Vec<RecordId> {
        let mut ids: Vec<_> = self
            .records
            .read()
            .unwrap()
            .values()
            .filter(|r| r.channel_id == channel_id)
            .map(|r| r.id)
            .collect();
        ids.sort();
        ids
    }
}

impl PersistenceSink for MemoryRecordStore {
    fn save(&self, record: &Record) -> std::result::Result<(), PersistenceError> {
        self.records
            .write()
            .map_err(|e| PersistenceError::Storage(e.to_string()))?
            .insert(record.id, record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::record::Direction;

    #[tokio::test]
    async fn test_cursor_store_roundtrip_and_log() {
        let store = MemoryCursorStore::new();
        let key = CursorKey::new(ChannelId(1), Direction::Forward);
        let other = CursorKey::new(ChannelId(1), Direction::Backward);

        assert_eq!(store.get(&key).await.unwrap(), None);
        store.set(&key, RecordId(3)).await.unwrap();
        store.set(&other, RecordId(9)).await.unwrap();
        store.set(&key, RecordId(5)).await.unwrap();

        assert_eq!(store.get(&key).await.unwrap(), Some(RecordId(5)));
        assert_eq!(store.get(&other).await.unwrap(), Some(RecordId(9)));
        assert_eq!(store.writes_for(&key), vec![RecordId(3), RecordId(5)]);
        assert_eq!(store.writes().len(), 3);
    }

    #[tokio::test]
    async fn test_seeded_cursor_is_not_a_write() {
        let key = CursorKey::new(ChannelId(2), Direction::Backward);
        let store = MemoryCursorStore::new().with_cursor(key, RecordId(7));

        assert_eq!(store.get(&key).await.unwrap(), Some(RecordId(7)));
        assert!(store.writes().is_empty());
    }

    #[test]
    fn test_record_store_is_idempotent() {
        let store = MemoryRecordStore::new();
        let record = Record::new(4u64, 1u64, "hi");

        store.save(&record).unwrap();
        store.save(&record).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.ids_for_channel(ChannelId(1)), vec![RecordId(4)]);
    }
}
