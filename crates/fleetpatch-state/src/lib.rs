//! fleetpatch-state — the durable journal behind a patch campaign.
//!
//! Backed by [redb](https://docs.rs/redb), it stores campaign records, a
//! write-ahead log of step outcomes, and the append-only progress log that
//! operators query while a campaign runs.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{campaign_id}|{step_key}`, `{campaign_id}|{seq}`) enable
//! prefix scans over one campaign's history.
//!
//! The `JournalStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and is shared by every task of every running campaign.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::JournalStore;
pub use tables::KEY_SEP;
pub use types::*;
