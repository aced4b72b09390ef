//! Reference count maintenance for a committing write.
//!
//! Counts are tracked per `(source, target)` edge: a chunk listing the same
//! target twice contributes one count. A chunk only propagates a change to
//! its refs when its own count moves between zero and non-zero, so a node
//! reached through several paths adjusts its children exactly once.

use std::collections::{BTreeMap, BTreeSet};

use snafu::OptionExt;
use syncstore_base::Hash;
use tracing::trace;

use super::{DagError, RefCountOverflowSnafu, RefCountUnderflowSnafu};

/// Access to the persisted counts and refs a computation starts from.
pub(crate) trait RefCountSource {
    /// The stored count, zero when absent.
    fn get_ref_count(&self, hash: &Hash) -> Result<u16, DagError>;

    /// The refs of the chunk, empty when the chunk is not stored.
    fn get_refs(&self, hash: &Hash) -> Result<Vec<Hash>, DagError>;
}

/// Old and new target of a head changed in one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeadChange {
    pub old: Option<Hash>,
    pub new: Option<Hash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delta {
    Inc,
    Dec,
}

struct Counter<'a, S> {
    source: &'a S,
    counts: BTreeMap<Hash, u16>,
}

impl<S: RefCountSource> Counter<'_, S> {
    fn load(&mut self, hash: &Hash) -> Result<u16, DagError> {
        if let Some(count) = self.counts.get(hash) {
            return Ok(*count);
        }
        let count = self.source.get_ref_count(hash)?;
        self.counts.insert(*hash, count);
        Ok(count)
    }

    fn change(&mut self, root: Hash, delta: Delta) -> Result<(), DagError> {
        let mut stack = vec![root];
        while let Some(hash) = stack.pop() {
            let old = self.load(&hash)?;
            let new = match delta {
                Delta::Inc => old
                    .checked_add(1)
                    .context(RefCountOverflowSnafu { hash })?,
                Delta::Dec => old
                    .checked_sub(1)
                    .context(RefCountUnderflowSnafu { hash })?,
            };
            self.counts.insert(hash, new);
            let transition = match delta {
                Delta::Inc => old == 0,
                Delta::Dec => new == 0,
            };
            if transition {
                let refs: BTreeSet<Hash> = self.source.get_refs(&hash)?.into_iter().collect();
                stack.extend(refs);
            }
        }
        Ok(())
    }
}

/// Computes the new ref count of every chunk touched by a write.
///
/// All increments are applied before any decrement so that a chunk moving
/// from one head to another never transiently drops to zero. Chunks written
/// in this transaction that end up unreferenced are reported with a count of
/// zero, meaning they must be deleted.
pub(crate) fn compute_ref_count_updates<'a, S: RefCountSource>(
    head_changes: impl IntoIterator<Item = &'a HeadChange> + Clone,
    put_chunks: &BTreeSet<Hash>,
    source: &S,
) -> Result<BTreeMap<Hash, u16>, DagError> {
    let mut counter = Counter {
        source,
        counts: BTreeMap::new(),
    };
    for change in head_changes.clone() {
        if change.old == change.new {
            continue;
        }
        if let Some(new) = change.new {
            counter.change(new, Delta::Inc)?;
        }
    }
    for change in head_changes {
        if change.old == change.new {
            continue;
        }
        if let Some(old) = change.old {
            counter.change(old, Delta::Dec)?;
        }
    }
    for hash in put_chunks {
        counter.load(hash)?;
    }
    trace!(updates = counter.counts.len(), "computed ref count updates");
    Ok(counter.counts)
}
