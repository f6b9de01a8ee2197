//! Per-batch lane bookkeeping

use super::filename::resolve_filename;
use linkdrop_types::{BatchProgress, DispatchMode, LaneEnd, LaneState, LinkDescriptor};
use std::sync::Arc;
use uuid::Uuid;

/// What a lane does at a given batch index
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkStep {
    /// Download `link` under `filename`
    Dispatch {
        link: LinkDescriptor,
        filename: String,
    },
    /// The lane stops here
    End(LaneEnd),
    /// The batch is no longer active
    Gone,
}

/// A batch that still has at least one unfinished lane
#[derive(Debug)]
pub(crate) struct ActiveBatch {
    pub id: Uuid,
    pub mode: DispatchMode,
    pub links: Arc<[LinkDescriptor]>,
    pub create_folder: bool,
    pub lanes: Vec<LaneState>,
    pub finished_links: usize,
}

impl ActiveBatch {
    pub fn new(
        id: Uuid,
        mode: DispatchMode,
        links: Arc<[LinkDescriptor]>,
        create_folder: bool,
        lane_count: usize,
    ) -> Self {
        Self {
            id,
            mode,
            links,
            create_folder,
            lanes: vec![LaneState::Idle; lane_count],
            finished_links: 0,
        }
    }

    /// Claim `index` for `lane`, marking the lane in flight when there is a link to fetch
    pub fn claim(&mut self, lane: usize, index: usize) -> LinkStep {
        let step = match self.links.get(index) {
            None => LinkStep::End(LaneEnd::Exhausted),
            Some(link) if link.is_exceeded() => LinkStep::End(LaneEnd::Exceeded),
            Some(link) => LinkStep::Dispatch {
                filename: resolve_filename(link, self.create_folder),
                link: link.clone(),
            },
        };

        if let (LinkStep::Dispatch { .. }, Some(state)) = (&step, self.lanes.get_mut(lane)) {
            *state = LaneState::InFlight { index };
        }
        step
    }

    pub fn finish_lane(&mut self, lane: usize, reason: LaneEnd) {
        if let Some(state) = self.lanes.get_mut(lane) {
            *state = LaneState::Finished { reason };
        }
    }

    /// Every lane reached its terminal condition
    pub fn is_drained(&self) -> bool {
        self.lanes.iter().all(LaneState::is_finished)
    }

    pub fn progress(&self) -> BatchProgress {
        BatchProgress {
            id: self.id,
            mode: self.mode,
            total: self.links.len(),
            finished_links: self.finished_links,
            lanes: self.lanes.clone(),
        }
    }
}
