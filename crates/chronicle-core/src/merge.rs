//! Last-writer-wins merge resolution
//!
//! The resolver is the single ordering primitive across devices: no
//! global clock exists, so `last_modified` comparison decides every
//! conflict. Applying the same remote set twice, or two sets in either
//! order, converges on the same store state.

use crate::types::{HistoryRecord, SyncStatus};

/// Resolve one incoming remote record against the local copy.
///
/// Returns the record the store should hold afterwards, or `None` when
/// the local copy wins and nothing must be written.
///
/// Rules:
/// - No local copy: the remote record is new here and wins outright.
/// - Remote `last_modified` is newer, or exactly equal (clock-skew tie,
///   broken deterministically in favor of the incoming record): remote
///   fields fully replace local fields.
/// - Otherwise the remote record is stale or a duplicate; local wins.
///
/// A winning remote record is stored with `sync_status` forced to
/// `Synced` and `last_modified` taken from the remote record, not from
/// the local clock, so causal ordering survives further merges.
/// Tombstones participate in the same comparison: a newer tombstone
/// deletes a live record, and a newer live record undeletes a tombstone.
pub fn resolve(local: Option<&HistoryRecord>, remote: &HistoryRecord) -> Option<HistoryRecord> {
    match local {
        None => Some(accept(remote)),
        Some(local) if remote.last_modified >= local.last_modified => Some(accept(remote)),
        Some(_) => None,
    }
}

fn accept(remote: &HistoryRecord) -> HistoryRecord {
    let mut merged = remote.clone();
    merged.sync_status = SyncStatus::Synced;
    merged
}
