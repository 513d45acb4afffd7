use std::fmt;

use serde::Serialize;

/// Stable handle for a submitted run.
///
/// Run ids are dense indices into an append-only registry. A settled run's
/// id stays valid as a reference; operations on it are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RunId(usize);

impl RunId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Append-only slab of run entries.
///
/// Entries are tombstoned on settlement and never reused or compacted, so
/// indices stay aligned with the ids handed out at submission.
#[derive(Debug)]
pub(crate) struct RunRegistry<S> {
    entries: Vec<Option<S>>,
    live: usize,
}

impl<S> Default for RunRegistry<S> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            live: 0,
        }
    }
}

impl<S> RunRegistry<S> {
    /// Append an entry and return its id.
    pub(crate) fn insert(&mut self, state: S) -> RunId {
        self.entries.push(Some(state));
        self.live += 1;
        RunId(self.entries.len() - 1)
    }

    pub(crate) fn get_mut(&mut self, id: RunId) -> Option<&mut S> {
        self.entries.get_mut(id.0).and_then(Option::as_mut)
    }

    pub(crate) fn contains(&self, id: RunId) -> bool {
        matches!(self.entries.get(id.0), Some(Some(_)))
    }

    /// Tombstone an entry, returning its state if it was still live.
    pub(crate) fn clear(&mut self, id: RunId) -> Option<S> {
        let state = self.entries.get_mut(id.0).and_then(Option::take);
        if state.is_some() {
            self.live -= 1;
        }
        state
    }

    /// Number of entries ever inserted (live or tombstoned).
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of entries not yet cleared.
    pub(crate) fn live(&self) -> usize {
        self.live
    }

    /// Ids of the live entries, ascending.
    pub(crate) fn live_ids(&self) -> Vec<RunId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(i, _)| RunId(i))
            .collect()
    }
}
