//! Domain types for the backfill engine.

pub mod config;
pub mod cursor;
pub mod job;
pub mod progress;
pub mod record;
