//! Persistence traits: the blocking record sink and the dead-letter path.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::PersistenceError;
use crate::types::record::Record;

/// Durable write of one record.
///
/// `save` is a blocking call. The write dispatcher runs it on tokio's
/// blocking pool, so implementations may block on I/O freely, and must
/// never be called directly from async code.
///
/// Saving the same record twice must be safe: retries rely on it.
pub trait PersistenceSink: Send + Sync + 'static {
    fn save(&self, record: &Record) -> Result<(), PersistenceError>;
}

impl<T: PersistenceSink + ?Sized> PersistenceSink for Arc<T> {
    fn save(&self, record: &Record) -> Result<(), PersistenceError> {
        (**self).save(record)
    }
}

/// Destination for records whose persistence kept failing.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(
        &self,
        record: &Record,
        error: &PersistenceError,
        attempts: u32,
    ) -> Result<(), PersistenceError>;
}
