//! Completion Tracker
//!
//! Maps an in-flight native download to the lane position that resumes when
//! the host reports the download finished.
//!
//! The host may report a download finished before the call that started it
//! has returned. Such early completions are held until the dispatch is
//! tracked, so the lane still continues.

use linkdrop_types::DownloadId;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Early completions kept at most; the oldest is dropped first
pub const EARLY_COMPLETION_CAPACITY: usize = 64;

/// Where a lane continues once a native download ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEntry {
    pub batch_id: Uuid,
    pub lane: usize,
    /// Batch index of the download being tracked
    pub index: usize,
    /// Batch index the lane dispatches next
    pub next_index: usize,
}

/// Outcome of a download that finished before it was tracked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarlyCompletion {
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct CompletionTracker {
    entries: HashMap<DownloadId, CompletionEntry>,
    early: HashMap<DownloadId, EarlyCompletion>,
    early_order: VecDeque<DownloadId>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a dispatched download; returns an entry it displaced, if any
    pub fn track(&mut self, id: DownloadId, entry: CompletionEntry) -> Option<CompletionEntry> {
        self.entries.insert(id, entry)
    }

    /// Consume the entry of a finished download
    pub fn take(&mut self, id: DownloadId) -> Option<CompletionEntry> {
        self.entries.remove(&id)
    }

    /// Hold the outcome of a finished download nobody tracks yet
    pub fn record_early(&mut self, id: DownloadId, error: Option<String>) {
        if self.early.insert(id, EarlyCompletion { error }).is_some() {
            return;
        }
        self.early_order.push_back(id);
        while self.early_order.len() > EARLY_COMPLETION_CAPACITY {
            if let Some(oldest) = self.early_order.pop_front() {
                self.early.remove(&oldest);
            }
        }
    }

    /// Consume the early completion of `id`, if the host already reported one
    pub fn take_early(&mut self, id: DownloadId) -> Option<EarlyCompletion> {
        let completion = self.early.remove(&id)?;
        self.early_order.retain(|held| *held != id);
        Some(completion)
    }

    /// Drop early completions that never matched a dispatch
    pub fn clear_early(&mut self) {
        self.early.clear();
        self.early_order.clear();
    }

    pub fn early_len(&self) -> usize {
        self.early.len()
    }

    pub fn contains(&self, id: DownloadId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of tracked downloads belonging to `batch_id`
    pub fn pending_for(&self, batch_id: Uuid) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.batch_id == batch_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
