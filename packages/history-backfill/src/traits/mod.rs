//! Core trait abstractions for the backfill engine.
//!
//! These traits define the external collaborators that applications
//! implement: where history comes from, where records and cursors go, and
//! where progress is shown.

pub mod cursor;
pub mod display;
pub mod sink;
pub mod source;
