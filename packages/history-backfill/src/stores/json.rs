//! JSON file cursor store.
//!
//! Keeps every cursor in one flat JSON object, `{"resume_from_123": 456}`,
//! the layout the bot's settings file has always used. Each write replaces
//! the file through a temp file and a rename, so a crash never leaves a
//! half-written file behind.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{BackfillError, Result};
use crate::traits::cursor::CursorStore;
use crate::types::cursor::{ChannelCursor, CursorKey};
use crate::types::record::RecordId;

type CursorMap = BTreeMap<String, u64>;

pub struct JsonFileCursorStore {
    path: PathBuf,
    cache: Mutex<Option<CursorMap>>,
}

impl JsonFileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every resume cursor in the file. Keys in other formats are skipped.
    pub async fn cursors(&self) -> Result<Vec<ChannelCursor>> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.load().await?);
        }
        Ok(cache
            .iter()
            .flat_map(|cursors| cursors.iter())
            .filter_map(|(raw, id)| {
                let key = CursorKey::parse(raw)?;
                Some(ChannelCursor {
                    channel_id: key.channel_id,
                    direction: key.direction,
                    last_record_id: RecordId(*id),
                })
            })
            .collect())
    }

    async fn load(&self) -> Result<CursorMap> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(CursorMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(store_error),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CursorMap::new()),
            Err(e) => Err(store_error(e)),
        }
    }

    async fn persist(&self, cursors: &CursorMap) -> Result<()> {
        let body = serde_json::to_vec_pretty(cursors).map_err(store_error)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await.map_err(store_error)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(store_error)?;
        Ok(())
    }
}

fn store_error(e: impl std::error::Error + Send + Sync + 'static) -> BackfillError {
    BackfillError::CursorStore(Box::new(e))
}

#[async_trait]
impl CursorStore for JsonFileCursorStore {
    async fn get(&self, key: &CursorKey) -> Result<Option<RecordId>> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.load().await?);
        }
        Ok(cache
            .as_ref()
            .and_then(|cursors| cursors.get(&key.to_string()))
            .map(|id| RecordId(*id)))
    }

    async fn set(&self, key: &CursorKey, record_id: RecordId) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let mut cursors = match cache.take() {
            Some(cursors) => cursors,
            None => self.load().await?,
        };
        cursors.insert(key.to_string(), record_id.get());

        let written = self.persist(&cursors).await;
        *cache = Some(cursors);
        written?;

        debug!(path = %self.path.display(), key = %key, cursor = %record_id, "cursor file updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::record::{ChannelId, Direction};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("backfill-{}-{}.json", name, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let store = JsonFileCursorStore::new(temp_path("missing"));
        let key = CursorKey::new(ChannelId(1), Direction::Forward);
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cursor_survives_reopen() {
        let path = temp_path("reopen");
        let forward = CursorKey::new(ChannelId(10), Direction::Forward);
        let backward = CursorKey::new(ChannelId(10), Direction::Backward);

        let store = JsonFileCursorStore::new(&path);
        store.set(&forward, RecordId(55)).await.unwrap();
        store.set(&backward, RecordId(12)).await.unwrap();
        drop(store);

        let reopened = JsonFileCursorStore::new(&path);
        assert_eq!(reopened.get(&forward).await.unwrap(), Some(RecordId(55)));
        assert_eq!(reopened.get(&backward).await.unwrap(), Some(RecordId(12)));

        let raw: CursorMap = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw.get("resume_from_10"), Some(&55));
        assert_eq!(raw.get("resume_before_10"), Some(&12));

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_cursors_skip_foreign_keys() {
        let path = temp_path("foreign");
        std::fs::write(&path, br#"{"og_messages": 5, "resume_from_3": 30}"#).unwrap();

        let cursors = JsonFileCursorStore::new(&path).cursors().await.unwrap();

        assert_eq!(
            cursors,
            vec![ChannelCursor {
                channel_id: ChannelId(3),
                direction: Direction::Forward,
                last_record_id: RecordId(30),
            }]
        );
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let path = temp_path("corrupt");
        std::fs::write(&path, b"{not json").unwrap();

        let store = JsonFileCursorStore::new(&path);
        let key = CursorKey::new(ChannelId(1), Direction::Forward);
        assert!(matches!(
            store.get(&key).await,
            Err(BackfillError::CursorStore(_))
        ));

        std::fs::remove_file(&path).ok();
    }
}
