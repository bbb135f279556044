//! Resume cursors.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::record::{ChannelId, Direction, RecordId};

/// Storage key of a cursor: one per (channel, direction).
///
/// Renders as `resume_from_{channel}` for forward crawls and
/// `resume_before_{channel}` for backward crawls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorKey {
    pub channel_id: ChannelId,
    pub direction: Direction,
}

impl CursorKey {
    pub fn new(channel_id: ChannelId, direction: Direction) -> Self {
        Self {
            channel_id,
            direction,
        }
    }

    /// Parse a rendered key back into its parts.
    pub fn parse(raw: &str) -> Option<Self> {
        [Direction::Forward, Direction::Backward]
            .into_iter()
            .find_map(|direction| {
                let rest = raw.strip_prefix(direction.key_prefix())?.strip_prefix('_')?;
                let channel_id = rest.parse().ok()?;
                Some(Self::new(channel_id, direction))
            })
    }
}

impl fmt::Display for CursorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.direction.key_prefix(), self.channel_id)
    }
}

/// The last record a crawl processed in a given direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCursor {
    pub channel_id: ChannelId,
    pub direction: Direction,
    pub last_record_id: RecordId,
}

impl ChannelCursor {
    pub fn key(&self) -> CursorKey {
        CursorKey::new(self.channel_id, self.direction)
    }

    /// Whether moving to `next` keeps the cursor monotonic.
    pub fn can_advance_to(&self, next: RecordId) -> bool {
        self.direction.is_beyond(next, self.last_record_id)
    }
}

/// When the crawler is allowed to move the cursor past a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorPolicy {
    /// Only past records whose write has settled (committed or dead-lettered),
    /// and only across a contiguous prefix in traversal order.
    #[default]
    AfterCommit,
    /// As soon as a record has been handed to the dispatcher.
    ///
    /// A crash between the cursor write and the commit skips the record on
    /// resume.
    OnSubmit,
}

impl std::str::FromStr for CursorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "after_commit" => Ok(CursorPolicy::AfterCommit),
            "on_submit" => Ok(CursorPolicy::OnSubmit),
            other => Err(format!("unknown cursor policy: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let forward = CursorKey::new(ChannelId(42), Direction::Forward);
        let backward = CursorKey::new(ChannelId(42), Direction::Backward);
        assert_eq!(forward.to_string(), "resume_from_42");
        assert_eq!(backward.to_string(), "resume_before_42");
        assert_ne!(forward, backward);
    }

    #[test]
    fn test_key_parse() {
        let key = CursorKey::parse("resume_before_1234").unwrap();
        assert_eq!(key.channel_id, ChannelId(1234));
        assert_eq!(key.direction, Direction::Backward);
        assert!(CursorKey::parse("og_messages").is_none());
        assert!(CursorKey::parse("resume_from_abc").is_none());
    }

    #[test]
    fn test_cursor_monotonic() {
        let cursor = ChannelCursor {
            channel_id: ChannelId(1),
            direction: Direction::Backward,
            last_record_id: RecordId(7),
        };
        assert!(cursor.can_advance_to(RecordId(3)));
        assert!(!cursor.can_advance_to(RecordId(7)));
        assert!(!cursor.can_advance_to(RecordId(9)));
    }

    #[test]
    fn test_cursor_policy_from_str() {
        assert_eq!("after-commit".parse::<CursorPolicy>().unwrap(), CursorPolicy::AfterCommit);
        assert_eq!("ON_SUBMIT".parse::<CursorPolicy>().unwrap(), CursorPolicy::OnSubmit);
        assert!("sometimes".parse::<CursorPolicy>().is_err());
    }
}
