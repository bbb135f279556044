//! Display sink that edits a Discord message in place.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{BackfillError, Result};
use crate::sources::discord::DiscordApi;
use crate::traits::display::DisplaySink;
use crate::types::job::JobSummary;
use crate::types::progress::{ProgressSnapshot, MAX_DESCRIPTION_CHARS};
use crate::types::record::{ChannelId, RecordId};

const ORANGE: u32 = 0xE67E22;
const GREEN: u32 = 0x2ECC71;

/// Edits one existing message with an embed per render.
pub struct DiscordMessageDisplay {
    api: DiscordApi,
    channel_id: ChannelId,
    message_id: RecordId,
}

impl DiscordMessageDisplay {
    pub fn new(api: DiscordApi, channel_id: ChannelId, message_id: RecordId) -> Self {
        Self {
            api,
            channel_id,
            message_id,
        }
    }

    async fn edit(&self, embed: Value) -> Result<()> {
        let path = format!("/channels/{}/messages/{}", self.channel_id, self.message_id);
        self.api
            .patch_json(&path, &json!({ "embeds": [embed] }))
            .await
            .map_err(|e| BackfillError::Display(Box::new(e)))
    }
}

fn progress_embed(snapshot: &ProgressSnapshot) -> Value {
    let mut embed = json!({
        "title": snapshot.title,
        "description": snapshot.description,
        "color": ORANGE,
        "timestamp": snapshot.timestamp.to_rfc3339(),
    });
    if !snapshot.author_label.is_empty() {
        embed["author"] = json!({ "name": snapshot.author_label });
    }
    embed
}

fn completion_embed(summary: &JobSummary) -> Value {
    let mut description = format!(
        "Backfilled {} messages across {} channels.",
        summary.records_committed(),
        summary.channels.len()
    );
    if summary.failed() > 0 {
        description.push_str(&format!(" {} channel(s) failed.", summary.failed()));
    }
    json!({
        "title": "Finished",
        "description": description,
        "color": GREEN,
    })
}

#[async_trait]
impl DisplaySink for DiscordMessageDisplay {
    async fn render(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        // Snapshots are clamped on construction; this guards hand-built ones.
        if snapshot.description.chars().count() > MAX_DESCRIPTION_CHARS {
            return Ok(());
        }
        self.edit(progress_embed(snapshot)).await
    }

    async fn render_completion(&self, summary: &JobSummary) -> Result<()> {
        self.edit(completion_embed(summary)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::job::{BackfillJob, ChannelReport, JobStatus};
    use crate::types::record::Direction;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    #[test]
    fn test_progress_embed_shape() {
        let ts = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let snapshot = ProgressSnapshot::new("Processing messages", "hello", "monkey", ts);

        let embed = progress_embed(&snapshot);

        assert_eq!(embed["title"], "Processing messages");
        assert_eq!(embed["description"], "hello");
        assert_eq!(embed["color"], ORANGE);
        assert_eq!(embed["author"]["name"], "monkey");
    }

    #[test]
    fn test_anonymous_snapshot_has_no_author() {
        let snapshot = ProgressSnapshot::new("t", "d", "", Utc::now());
        assert!(progress_embed(&snapshot).get("author").is_none());
    }

    #[test]
    fn test_completion_embed_mentions_failures() {
        let mut summary = JobSummary::new(Uuid::new_v4());
        let job = BackfillJob::new(ChannelId(1), Direction::Forward);
        let mut ok = ChannelReport::new(&job);
        ok.status = JobStatus::Completed;
        ok.records_committed = 12;
        summary.channels.push(ok);
        summary.channels.push(ChannelReport::failed_with(&job, "boom"));

        let embed = completion_embed(&summary);

        assert_eq!(embed["title"], "Finished");
        assert_eq!(
            embed["description"],
            "Backfilled 12 messages across 2 channels. 1 channel(s) failed."
        );
    }
}
