//! History source implementations.

#[cfg(feature = "discord")]
pub mod discord;
pub mod rate_limited;

#[cfg(feature = "discord")]
pub use discord::{DiscordApi, DiscordHistorySource};
pub use rate_limited::RateLimitedSource;
