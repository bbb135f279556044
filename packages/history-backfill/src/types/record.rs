//! Identifiers, records and traversal direction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! snowflake_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }
    };
}

snowflake_id!(
    /// Identifier of a single history record (message).
    ///
    /// Ids are monotonic in creation order, so traversal order is id order.
    RecordId
);

snowflake_id!(
    /// Identifier of a channel.
    ChannelId
);

snowflake_id!(
    /// Identifier of a guild (a group of channels).
    GuildId
);

snowflake_id!(
    /// Identifier of a record author.
    AuthorId
);

/// Traversal direction of a crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Oldest first, ascending ids.
    Forward,
    /// Newest first, descending ids.
    Backward,
}

impl Direction {
    /// True when `candidate` lies strictly past `reference` in this direction.
    pub fn is_beyond(self, candidate: RecordId, reference: RecordId) -> bool {
        match self {
            Direction::Forward => candidate > reference,
            Direction::Backward => candidate < reference,
        }
    }

    /// Cursor key prefix, kept compatible with existing resume files.
    pub fn key_prefix(self) -> &'static str {
        match self {
            Direction::Forward => "resume_from",
            Direction::Backward => "resume_before",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forward" | "oldest_first" => Ok(Direction::Forward),
            "backward" | "newest_first" => Ok(Direction::Backward),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// A single unit of channel history.
///
/// The crawler treats the content as opaque. It relies on `id` for cursor
/// bookkeeping and on `timestamp`/`author_name` for progress display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub channel_id: ChannelId,
    pub author_id: AuthorId,
    pub author_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Create a record with minimal fields.
    pub fn new(
        id: impl Into<RecordId>,
        channel_id: impl Into<ChannelId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            channel_id: channel_id.into(),
            author_id: AuthorId(0),
            author_name: String::new(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Set the author.
    pub fn with_author(mut self, id: impl Into<AuthorId>, name: impl Into<String>) -> Self {
        self.author_id = id.into();
        self.author_name = name.into();
        self
    }

    /// Set the creation timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A channel that can be crawled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
}

impl ChannelInfo {
    pub fn new(id: impl Into<ChannelId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}
