// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cross-checks run after manifest replay and after a checkpoint, verifying
//! round-trip and idempotence of the replayed state.

use crate::error::{Error, Result};
use crate::groove::Groove;
use crate::manifest_log::ManifestLog;

/// Confirms that forward replay (the forest dispatching each manifest
/// event to its owning tree, as `open` does) reconstructed exactly the
/// same set of tables as the manifest log's own reverse replay, table for
/// table, including `key_min`, `key_max`, `checksum`, `address`,
/// `snapshot_min`/`snapshot_max`, `tree_id`, and `label.level`.
///
/// # Errors
///
/// Returns [`Error::InvariantViolation`] if the two reconstructions
/// disagree on any table.
pub fn verify_tables_recovered(grooves: &[Groove], manifest_log: &dyn ManifestLog) -> Result<()> {
    let mut forward: Vec<_> = grooves
        .iter()
        .flat_map(Groove::trees)
        .flat_map(|tree| tree.tables().iter().cloned())
        .collect();
    forward.sort_by_key(|table| (table.tree_id, table.address));

    let mut reverse = manifest_log.tables_latest();
    reverse.sort_by_key(|table| (table.tree_id, table.address));

    if forward != reverse {
        return Err(Error::InvariantViolation(format!(
            "forward replay recovered {} tables but manifest log reverse replay reports {}",
            forward.len(),
            reverse.len()
        )));
    }

    Ok(())
}

/// Confirms `Σ over (tree, level) of tables.len == manifest_log.table_extents.count`.
///
/// # Errors
///
/// Returns [`Error::InvariantViolation`] if the totals disagree.
pub fn verify_table_extents(grooves: &[Groove], manifest_log: &dyn ManifestLog) -> Result<()> {
    let total: u64 = grooves.iter().map(Groove::table_count).sum();
    let extents = manifest_log.table_extents_count();

    if total as usize != extents {
        return Err(Error::InvariantViolation(format!(
            "trees report {total} live tables but the manifest log tracks {extents} extents"
        )));
    }

    Ok(())
}
