//! The `persistence` module provides the durable log behind queue
//! destinations.
//!
//! Each queue owns one file, `<data_dir>/<urlsafe-base64(name)>.msg.dat`,
//! holding a 12-byte header followed by fixed-prefix message records. See
//! [`record`] for the exact layout and [`file_store::MessageStore`] for the
//! send / receive / ack / compaction protocol.

pub mod file_store;
pub mod record;

pub use file_store::{
    CompactionPolicy, CompactionStats, MessageStore, ReceivedMessage, RecoveryPolicy, StoreConfig,
};

use crate::utils::error::{StoreError, StoreResult};

/// Suffix that turns a destination name into a prefix-matching pattern.
pub const WILDCARD_SUFFIX: char = '>';

/// Destination names are `[A-Za-z0-9/_.-]+`, optionally followed by a
/// single trailing wildcard.
pub fn validate_destination_name(name: &str) -> StoreResult<()> {
    let stem = name.strip_suffix(WILDCARD_SUFFIX).unwrap_or(name);
    let valid = !stem.is_empty()
        && stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '.' | '_'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName {
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests;
