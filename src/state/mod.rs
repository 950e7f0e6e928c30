//! Durable state for canopy.
//!
//! Tasks and events are written through to an append-only journal so a
//! restarted server can rebuild its forest and replay history.

pub(crate) mod journal;

pub use journal::{Journal, JournalContents};
