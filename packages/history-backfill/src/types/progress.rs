//! Progress display state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::record::Record;

/// Upper bound for a rendered description.
///
/// Discord embeds reject descriptions of 2000 characters or more.
pub const MAX_DESCRIPTION_CHARS: usize = 1900;

const TITLE: &str = "Processing messages";

/// Ephemeral render state for the progress display.
///
/// Advisory UI only: intermediate snapshots are superseded without being
/// rendered, and nothing about resume correctness depends on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub title: String,
    pub description: String,
    pub author_label: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        author_label: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            title: title.into(),
            description: clamp(description.into()),
            author_label: author_label.into(),
            timestamp,
        }
    }

    /// Build the "last processed message" snapshot for a record.
    pub fn from_record(record: &Record) -> Self {
        let description = format!(
            "Last message text: {}, from {}, in <#{}>",
            record.content,
            record.timestamp.format("%Y-%m-%d %H:%M"),
            record.channel_id
        );
        Self::new(TITLE, description, record.author_name.clone(), record.timestamp)
    }
}

fn clamp(text: String) -> String {
    if text.chars().count() <= MAX_DESCRIPTION_CHARS {
        return text;
    }
    let mut clamped: String = text.chars().take(MAX_DESCRIPTION_CHARS - 1).collect();
    clamped.push('…');
    clamped
}
