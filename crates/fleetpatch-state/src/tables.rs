//! redb table definitions for the campaign journal.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys use `|` as separator because step keys themselves contain `/` and `:`.

use redb::TableDefinition;

/// Campaign records keyed by `{campaign_id}`.
pub const CAMPAIGNS: TableDefinition<&str, &[u8]> = TableDefinition::new("campaigns");

/// Step outcomes keyed by `{campaign_id}|{step_key}`.
pub const STEPS: TableDefinition<&str, &[u8]> = TableDefinition::new("steps");

/// Progress entries keyed by `{campaign_id}|{seq:010}`.
pub const PROGRESS: TableDefinition<&str, &[u8]> = TableDefinition::new("progress");

/// Milestone keys already written to the progress log, keyed by
/// `{campaign_id}|{milestone_key}` with the sequence number as value.
pub const PROGRESS_KEYS: TableDefinition<&str, u64> = TableDefinition::new("progress_keys");

/// Separator between campaign id and the rest of a composite key.
pub const KEY_SEP: char = '|';

/// Build a composite key scoped to one campaign.
pub fn scoped_key(campaign_id: &str, rest: &str) -> String {
    format!("{campaign_id}{KEY_SEP}{rest}")
}

/// Prefix matching every composite key of one campaign.
pub fn campaign_prefix(campaign_id: &str) -> String {
    format!("{campaign_id}{KEY_SEP}")
}

/// Exclusive upper bound of every composite key of one campaign.
pub fn prefix_end(campaign_id: &str) -> String {
    format!("{campaign_id}{}", char::from(KEY_SEP as u8 + 1))
}
