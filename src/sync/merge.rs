//! Replica merge rules. Both are order-insensitive and idempotent: applying
//! the same incoming copy twice changes nothing the second time.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::TrainingProgram;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramMerge {
    Insert,
    Replace,
    /// The local copy is at least as new.
    KeepLocal,
    /// A tombstone at least as new as the incoming edit exists.
    Deleted,
    /// Built-ins are never replicated.
    NotCustom,
}

impl ProgramMerge {
    pub fn writes(&self) -> bool {
        matches!(self, ProgramMerge::Insert | ProgramMerge::Replace)
    }
}

/// Decides what a received program copy does to the local catalog. Copies are
/// ordered by `(created_at, modified_at)`, so a replica never regresses.
pub fn merge_program(
    local: Option<&TrainingProgram>,
    tombstone: Option<DateTime<Utc>>,
    incoming: &TrainingProgram,
) -> ProgramMerge {
    if !incoming.is_custom {
        return ProgramMerge::NotCustom;
    }
    if let Some(deleted_at) = tombstone {
        if incoming.modified_at <= deleted_at {
            return ProgramMerge::Deleted;
        }
    }
    match local {
        None => ProgramMerge::Insert,
        Some(local) if incoming.revision() > local.revision() => ProgramMerge::Replace,
        Some(_) => ProgramMerge::KeepLocal,
    }
}

/// Whether a deletion should remove the local copy.
pub fn deletion_applies(local: &TrainingProgram, deleted_at: DateTime<Utc>) -> bool {
    local.modified_at <= deleted_at
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MergeSummary {
    pub inserted: usize,
    pub replaced: usize,
    pub kept: usize,
    pub suppressed: usize,
}

impl MergeSummary {
    pub fn record(&mut self, decision: ProgramMerge) {
        match decision {
            ProgramMerge::Insert => self.inserted += 1,
            ProgramMerge::Replace => self.replaced += 1,
            ProgramMerge::KeepLocal => self.kept += 1,
            ProgramMerge::Deleted | ProgramMerge::NotCustom => self.suppressed += 1,
        }
    }

    pub fn changed(&self) -> usize {
        self.inserted + self.replaced
    }
}
