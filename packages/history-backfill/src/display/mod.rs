//! Progress display implementations.

#[cfg(feature = "discord")]
pub mod discord;
pub mod log;

#[cfg(feature = "discord")]
pub use discord::DiscordMessageDisplay;
pub use log::LogDisplay;
