//! Download Orchestrator - drives batches of links to completion
//!
//! Each batch is either:
//! - Native: up to ten lanes over the host download facility. Lane `k` walks
//!   indices `k, k+10, k+20, ...` and only moves on when the host reports the
//!   previous download of that lane finished (see [`CompletionTracker`]).
//! - DOM: a single sequential lane that clicks each link inside an execution
//!   context while a scoped header rule is installed (see `sequential.rs`).
//!
//! Lane state lives in one mutex that is never held across an `.await`.

use super::completion::{CompletionEntry, CompletionTracker, EarlyCompletion};
use super::lanes::{ActiveBatch, LinkStep};
use super::sequential::DomTiming;
use crate::host::{DownloadHost, HostBindings, TabHost};
use crate::rules::HeaderPreparer;
use linkdrop_types::{
    BatchProgress, CoreEvent, DispatchMode, DownloadBatch, DownloadDelta, DownloadId, HeaderSpec,
    LaneEnd, LinkDescriptor, NativeDownloadRequest, Settings,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Native downloads in flight per batch, and the stride of each lane
pub const MAX_PARALLEL_DOWNLOADS: usize = 10;

/// Orchestrates download batches
#[derive(Clone)]
pub struct DownloadOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    downloads: Arc<dyn DownloadHost>,
    tabs: Arc<dyn TabHost>,
    headers: HeaderPreparer,
    settings: Arc<RwLock<Settings>>,
    state: Mutex<OrchestratorState>,
    event_tx: broadcast::Sender<CoreEvent>,
}

#[derive(Default)]
struct OrchestratorState {
    batches: HashMap<Uuid, ActiveBatch>,
    tracker: CompletionTracker,
}

impl DownloadOrchestrator {
    pub fn new(
        hosts: &HostBindings,
        headers: HeaderPreparer,
        settings: Arc<RwLock<Settings>>,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                downloads: hosts.downloads.clone(),
                tabs: hosts.tabs.clone(),
                headers,
                settings,
                state: Mutex::new(OrchestratorState::default()),
                event_tx,
            }),
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Start a batch and return its id
    ///
    /// The dispatch mode and folder policy are decided here, once, from the
    /// batch's header spec and the current settings.
    pub async fn start_download(&self, batch: DownloadBatch) -> Uuid {
        let settings = self.inner.settings.read().await.clone();
        let create_folder = settings.create_folder(batch.kind);
        let dom_rule = batch
            .headers
            .as_ref()
            .and_then(HeaderSpec::for_download)
            .cloned();

        let mode = if dom_rule.is_some() {
            DispatchMode::Dom
        } else {
            DispatchMode::Native
        };
        let links: Arc<[LinkDescriptor]> = batch.links.into();
        let total = links.len();
        let lane_count = match mode {
            DispatchMode::Native => total.min(MAX_PARALLEL_DOWNLOADS),
            DispatchMode::Dom => 1,
        };

        let batch_id = Uuid::new_v4();
        info!(%batch_id, ?mode, total, create_folder, "Starting download batch");

        self.inner.state.lock().batches.insert(
            batch_id,
            ActiveBatch::new(batch_id, mode, links, create_folder, lane_count),
        );
        self.emit(CoreEvent::BatchStarted {
            batch_id,
            mode,
            total,
        });

        match dom_rule {
            Some(rule) => {
                let timing = DomTiming::from_settings(&settings);
                tokio::spawn(self.clone().run_sequential(batch_id, rule, timing));
            }
            None if lane_count == 0 => self.complete_if_drained(batch_id),
            None => {
                for lane in 0..lane_count {
                    self.advance_lane(batch_id, lane, lane).await;
                }
            }
        }

        batch_id
    }

    /// Feed a download status change from the host
    ///
    /// Only terminal changes of downloads this orchestrator started matter; a
    /// failed download continues its lane exactly like a successful one. While
    /// batches are active, a change for an untracked id is held in case its
    /// dispatch has not been recorded yet.
    pub async fn download_status_changed(&self, delta: &DownloadDelta) {
        if !delta.is_terminal() {
            return;
        }

        let entry = {
            let mut state = self.inner.state.lock();
            let entry = state.tracker.take(delta.id);
            if entry.is_none() && !state.batches.is_empty() {
                state.tracker.record_early(delta.id, delta.error.clone());
            }
            entry
        };
        let Some(entry) = entry else {
            debug!(download_id = %delta.id, "No dispatch tracked for finished download");
            return;
        };

        self.link_finished(entry.batch_id, entry.index, delta.error.clone());
        self.advance_lane(entry.batch_id, entry.lane, entry.next_index)
            .await;
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn batch_progress(&self, batch_id: Uuid) -> Option<BatchProgress> {
        self.inner
            .state
            .lock()
            .batches
            .get(&batch_id)
            .map(ActiveBatch::progress)
    }

    pub fn active_batches(&self) -> Vec<BatchProgress> {
        self.inner
            .state
            .lock()
            .batches
            .values()
            .map(ActiveBatch::progress)
            .collect()
    }

    /// Native downloads still awaiting a completion notification
    pub fn pending_completions(&self) -> usize {
        self.inner.state.lock().tracker.len()
    }

    /// Completions reported for downloads whose dispatch is not tracked
    pub fn early_completions(&self) -> usize {
        self.inner.state.lock().tracker.early_len()
    }

    // ========================================================================
    // Native lanes
    // ========================================================================

    /// Dispatch the next link of a native lane, starting at `index`
    ///
    /// Stops after one successful dispatch; the lane resumes from the
    /// completion tracker. Links the host refuses to start count as finished
    /// with an error and the lane moves straight on.
    async fn advance_lane(&self, batch_id: Uuid, lane: usize, mut index: usize) {
        loop {
            let (link, filename) = match self.claim(batch_id, lane, index) {
                LinkStep::Dispatch { link, filename } => (link, filename),
                LinkStep::End(reason) => {
                    self.finish_lane(batch_id, lane, reason);
                    return;
                }
                LinkStep::Gone => return,
            };

            let next_index = index + MAX_PARALLEL_DOWNLOADS;
            let request = NativeDownloadRequest {
                url: link.url,
                filename,
                save_as: false,
            };

            match self.inner.downloads.download(request).await {
                Ok(download_id) => {
                    let entry = CompletionEntry {
                        batch_id,
                        lane,
                        index,
                        next_index,
                    };
                    let Some(early) = self.track(download_id, entry) else {
                        return;
                    };

                    debug!(
                        %batch_id,
                        index,
                        %download_id,
                        "Download finished before it was tracked"
                    );
                    self.link_finished(batch_id, index, early.error);
                    index = next_index;
                }
                Err(e) => {
                    warn!(%batch_id, index, "Host refused to start download: {}", e);
                    self.link_finished(batch_id, index, Some(e.to_string()));
                    index = next_index;
                }
            }
        }
    }

    /// Record a dispatched download
    ///
    /// Returns the download's outcome instead when the host already reported
    /// it finished; nothing is tracked then.
    fn track(&self, download_id: DownloadId, entry: CompletionEntry) -> Option<EarlyCompletion> {
        let (early, displaced) = {
            let mut state = self.inner.state.lock();
            match state.tracker.take_early(download_id) {
                Some(early) => (Some(early), None),
                None => (None, state.tracker.track(download_id, entry)),
            }
        };
        if let Some(displaced) = displaced {
            warn!(%download_id, ?displaced, "Host reused a download id still in flight");
        }

        debug!(
            batch_id = %entry.batch_id,
            lane = entry.lane,
            index = entry.index,
            %download_id,
            "Dispatched native download"
        );
        self.emit(CoreEvent::LinkDispatched {
            batch_id: entry.batch_id,
            index: entry.index,
            download_id: Some(download_id),
        });
        early
    }

    // ========================================================================
    // Shared lane bookkeeping
    // ========================================================================

    pub(crate) fn claim(&self, batch_id: Uuid, lane: usize, index: usize) -> LinkStep {
        match self.inner.state.lock().batches.get_mut(&batch_id) {
            Some(batch) => batch.claim(lane, index),
            None => LinkStep::Gone,
        }
    }

    pub(crate) fn link_dispatched(&self, batch_id: Uuid, index: usize) {
        self.emit(CoreEvent::LinkDispatched {
            batch_id,
            index,
            download_id: None,
        });
    }

    pub(crate) fn link_finished(&self, batch_id: Uuid, index: usize, error: Option<String>) {
        if let Some(batch) = self.inner.state.lock().batches.get_mut(&batch_id) {
            batch.finished_links += 1;
        }
        self.emit(CoreEvent::LinkFinished {
            batch_id,
            index,
            error,
        });
    }

    pub(crate) fn finish_lane(&self, batch_id: Uuid, lane: usize, reason: LaneEnd) {
        let known = match self.inner.state.lock().batches.get_mut(&batch_id) {
            Some(batch) => {
                batch.finish_lane(lane, reason);
                true
            }
            None => false,
        };
        if !known {
            return;
        }

        debug!(%batch_id, lane, ?reason, "Lane finished");
        self.emit(CoreEvent::LaneFinished {
            batch_id,
            lane,
            reason,
        });
        self.complete_if_drained(batch_id);
    }

    fn complete_if_drained(&self, batch_id: Uuid) {
        let completed = {
            let mut state = self.inner.state.lock();
            let drained = state
                .batches
                .get(&batch_id)
                .map(ActiveBatch::is_drained)
                .unwrap_or(false);
            if drained {
                let batch = state.batches.remove(&batch_id);
                if state.batches.is_empty() {
                    state.tracker.clear_early();
                }
                batch
            } else {
                None
            }
        };

        if let Some(batch) = completed {
            info!(
                %batch_id,
                finished = batch.finished_links,
                total = batch.links.len(),
                "Download batch completed"
            );
            self.emit(CoreEvent::BatchCompleted { batch_id });
        }
    }

    pub(crate) fn tabs(&self) -> &Arc<dyn TabHost> {
        &self.inner.tabs
    }

    pub(crate) fn headers(&self) -> &HeaderPreparer {
        &self.inner.headers
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.inner.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostError;
    use crate::rules::RuleStore;
    use crate::test_support::TestHost;
    use async_trait::async_trait;
    use linkdrop_types::{BatchKind, LaneState};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::OnceLock;

    struct Fixture {
        host: TestHost,
        orchestrator: DownloadOrchestrator,
        events: broadcast::Receiver<CoreEvent>,
    }

    fn fixture_with(settings: Settings) -> Fixture {
        let host = TestHost::new();
        let bindings = host.bindings();
        orchestrator_fixture(host, bindings, settings)
    }

    fn orchestrator_fixture(host: TestHost, bindings: HostBindings, settings: Settings) -> Fixture {
        let (event_tx, events) = broadcast::channel(1024);
        let store = Arc::new(RuleStore::new(bindings.rules.clone(), event_tx.clone()));
        let orchestrator = DownloadOrchestrator::new(
            &bindings,
            HeaderPreparer::new(store),
            Arc::new(RwLock::new(settings)),
            event_tx,
        );
        Fixture {
            host,
            orchestrator,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Settings::default())
    }

    fn url(index: usize) -> String {
        format!("https://cdn.example/{}.jpg", index)
    }

    fn links(count: usize) -> Vec<LinkDescriptor> {
        (0..count)
            .map(|i| LinkDescriptor::new(url(i), format!("{}.jpg", i)))
            .collect()
    }

    fn drain(events: &mut broadcast::Receiver<CoreEvent>) -> Vec<CoreEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    async fn complete(fx: &Fixture, index: usize) {
        let id = fx.host.downloads.id_for(&url(index)).expect("index was dispatched");
        fx.orchestrator
            .download_status_changed(&DownloadDelta::completed(id))
            .await;
    }

    #[tokio::test]
    async fn test_twenty_five_links_fan_out_in_lanes() {
        let fx = fixture();
        let batch_id = fx.orchestrator.start_download(DownloadBatch::multi(links(25))).await;

        let initial: Vec<String> = (0..10).map(url).collect();
        assert_eq!(fx.host.downloads.dispatched_urls(), initial);
        assert_eq!(fx.orchestrator.pending_completions(), 10);

        complete(&fx, 3).await;
        assert_eq!(fx.host.downloads.dispatched_urls().last(), Some(&url(13)));

        complete(&fx, 13).await;
        assert_eq!(fx.host.downloads.dispatched_urls().last(), Some(&url(23)));

        complete(&fx, 23).await;
        assert_eq!(fx.host.downloads.dispatched_urls().len(), 12);

        let progress = fx.orchestrator.batch_progress(batch_id).unwrap();
        assert_eq!(
            progress.lanes[3],
            LaneState::Finished {
                reason: LaneEnd::Exhausted
            }
        );
        assert_eq!(progress.lanes[4], LaneState::InFlight { index: 4 });
        assert_eq!(progress.finished_links, 3);
    }

    #[tokio::test]
    async fn test_every_index_dispatched_once_after_its_predecessor() {
        let mut fx = fixture();
        let total = 37;
        let batch_id = fx.orchestrator.start_download(DownloadBatch::multi(links(total))).await;

        let mut completed: HashSet<usize> = HashSet::new();
        loop {
            let dispatched: Vec<usize> = fx
                .host
                .downloads
                .dispatched_urls()
                .iter()
                .map(|u| (0..total).find(|i| &url(*i) == u).unwrap())
                .collect();

            for index in &dispatched {
                if *index >= MAX_PARALLEL_DOWNLOADS {
                    assert!(completed.contains(&(index - MAX_PARALLEL_DOWNLOADS)));
                }
            }
            assert!(dispatched.len() - completed.len() <= MAX_PARALLEL_DOWNLOADS);

            // Finish the newest in-flight download first to shuffle lane order
            let Some(next) = dispatched
                .iter()
                .rev()
                .find(|i| !completed.contains(*i))
                .copied()
            else {
                break;
            };
            completed.insert(next);
            complete(&fx, next).await;
        }

        let mut dispatched = fx.host.downloads.dispatched_urls();
        assert_eq!(dispatched.len(), total);
        dispatched.sort();
        dispatched.dedup();
        assert_eq!(dispatched.len(), total);

        assert!(fx.orchestrator.batch_progress(batch_id).is_none());
        assert_eq!(fx.orchestrator.pending_completions(), 0);
        let events = drain(&mut fx.events);
        assert!(matches!(
            events.last(),
            Some(CoreEvent::BatchCompleted { batch_id: id }) if *id == batch_id
        ));
    }

    #[tokio::test]
    async fn test_exceeded_sentinel_stops_only_its_lane() {
        let fx = fixture();
        let mut batch_links = links(15);
        batch_links[3] = LinkDescriptor::exceeded();
        batch_links[12] = LinkDescriptor::exceeded();
        let batch_id = fx.orchestrator.start_download(DownloadBatch::multi(batch_links)).await;

        // Lane 3 never dispatches
        assert_eq!(fx.host.downloads.dispatched_urls().len(), 9);
        let progress = fx.orchestrator.batch_progress(batch_id).unwrap();
        assert_eq!(
            progress.lanes[3],
            LaneState::Finished {
                reason: LaneEnd::Exceeded
            }
        );

        // Lane 2 reaches the sentinel at 12 and stops
        complete(&fx, 2).await;
        assert_eq!(fx.host.downloads.dispatched_urls().len(), 9);

        // Lane 1 is unaffected
        complete(&fx, 1).await;
        assert_eq!(fx.host.downloads.dispatched_urls().last(), Some(&url(11)));

        let progress = fx.orchestrator.batch_progress(batch_id).unwrap();
        assert_eq!(
            progress.lanes[2],
            LaneState::Finished {
                reason: LaneEnd::Exceeded
            }
        );
        assert_eq!(progress.lanes[1], LaneState::InFlight { index: 11 });
    }

    #[tokio::test]
    async fn test_failed_download_continues_lane() {
        let fx = fixture();
        fx.orchestrator.start_download(DownloadBatch::multi(links(12))).await;

        let id = fx.host.downloads.id_for(&url(0)).unwrap();
        fx.orchestrator
            .download_status_changed(&DownloadDelta::failed(id, "NETWORK_FAILED"))
            .await;

        assert_eq!(fx.host.downloads.dispatched_urls().last(), Some(&url(10)));
    }

    #[tokio::test]
    async fn test_refused_dispatch_moves_to_next_index() {
        let fx = fixture();
        fx.host.downloads.fail_url(&url(1));
        fx.host.downloads.fail_url(&url(11));

        let batch_id = fx.orchestrator.start_download(DownloadBatch::multi(links(25))).await;

        let dispatched = fx.host.downloads.dispatched_urls();
        assert!(dispatched.contains(&url(11)));
        assert!(dispatched.contains(&url(21)));
        assert_eq!(fx.orchestrator.pending_completions(), 10);

        let progress = fx.orchestrator.batch_progress(batch_id).unwrap();
        assert_eq!(progress.lanes[1], LaneState::InFlight { index: 21 });
        assert_eq!(progress.finished_links, 2);
    }

    #[tokio::test]
    async fn test_untracked_and_non_terminal_changes_are_ignored() {
        let fx = fixture();
        fx.orchestrator.start_download(DownloadBatch::multi(links(11))).await;
        let id = fx.host.downloads.id_for(&url(0)).unwrap();

        fx.orchestrator
            .download_status_changed(&DownloadDelta::completed(DownloadId(9999)))
            .await;
        fx.orchestrator
            .download_status_changed(&DownloadDelta {
                id,
                error: None,
                end_time: None,
            })
            .await;

        assert_eq!(fx.host.downloads.dispatched_urls().len(), 10);
        assert_eq!(fx.orchestrator.pending_completions(), 10);

        // A repeated terminal notification only continues the lane once
        fx.orchestrator
            .download_status_changed(&DownloadDelta::completed(id))
            .await;
        fx.orchestrator
            .download_status_changed(&DownloadDelta::completed(id))
            .await;
        assert_eq!(fx.host.downloads.dispatched_urls().len(), 11);
    }

    #[tokio::test]
    async fn test_folder_policy_is_resolved_per_batch_kind() {
        let fx = fixture_with(Settings {
            per_file_folder: false,
            batch_folder: true,
            ..Settings::default()
        });
        let link = LinkDescriptor::new(url(0), "a/b.jpg").with_folder("Album");

        fx.orchestrator.start_download(DownloadBatch::multi(vec![link.clone()])).await;
        fx.orchestrator.start_download(DownloadBatch::single(link)).await;

        let requests = fx.host.downloads.requests();
        assert_eq!(requests[0].filename, "Album/a-b.jpg");
        assert_eq!(requests[1].filename, "a-b.jpg");
        assert!(requests.iter().all(|r| !r.save_as));
    }

    #[tokio::test]
    async fn test_empty_batch_completes_immediately() {
        let mut fx = fixture();
        let batch = DownloadBatch {
            kind: BatchKind::Multi,
            links: Vec::new(),
            headers: None,
        };

        let batch_id = fx.orchestrator.start_download(batch).await;

        assert!(fx.orchestrator.active_batches().is_empty());
        let events = drain(&mut fx.events);
        assert!(matches!(
            events.last(),
            Some(CoreEvent::BatchCompleted { batch_id: id }) if *id == batch_id
        ));
    }

    #[tokio::test]
    async fn test_batches_progress_independently() {
        let fx = fixture();
        let first = fx.orchestrator.start_download(DownloadBatch::multi(links(2))).await;
        let second_links: Vec<LinkDescriptor> = (100..103)
            .map(|i| LinkDescriptor::new(url(i), format!("{}.jpg", i)))
            .collect();
        let second = fx.orchestrator.start_download(DownloadBatch::multi(second_links)).await;

        complete(&fx, 0).await;
        complete(&fx, 1).await;

        assert!(fx.orchestrator.batch_progress(first).is_none());
        assert_eq!(fx.orchestrator.batch_progress(second).unwrap().lanes.len(), 3);
        assert_eq!(fx.orchestrator.pending_completions(), 3);
    }

    /// Reports every download finished before `download` returns its id
    #[derive(Default)]
    struct EagerDownloads {
        next_id: AtomicU64,
        orchestrator: OnceLock<DownloadOrchestrator>,
        urls: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DownloadHost for EagerDownloads {
        async fn download(&self, request: NativeDownloadRequest) -> Result<DownloadId, HostError> {
            let id = DownloadId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            self.urls.lock().push(request.url);

            if let Some(orchestrator) = self.orchestrator.get() {
                let delta = if id.0 % 4 == 0 {
                    DownloadDelta::failed(id, "NETWORK_FAILED")
                } else {
                    DownloadDelta::completed(id)
                };
                orchestrator.download_status_changed(&delta).await;
            }
            Ok(id)
        }
    }

    #[tokio::test]
    async fn test_completion_reported_before_dispatch_returns_continues_lane() {
        let host = TestHost::new();
        let eager = Arc::new(EagerDownloads::default());
        let bindings = HostBindings::new(eager.clone(), host.rules.clone(), host.tabs.clone());
        let mut fx = orchestrator_fixture(host, bindings, Settings::default());
        let _ = eager.orchestrator.set(fx.orchestrator.clone());

        let batch_id = fx.orchestrator.start_download(DownloadBatch::multi(links(25))).await;

        let mut dispatched = eager.urls.lock().clone();
        dispatched.sort();
        let mut expected: Vec<String> = (0..25).map(url).collect();
        expected.sort();
        assert_eq!(dispatched, expected);

        assert!(fx.orchestrator.batch_progress(batch_id).is_none());
        assert_eq!(fx.orchestrator.pending_completions(), 0);
        assert_eq!(fx.orchestrator.early_completions(), 0);

        let events = drain(&mut fx.events);
        let failed = events
            .iter()
            .filter(|e| matches!(e, CoreEvent::LinkFinished { error: Some(_), .. }))
            .count();
        assert_eq!(failed, 6);
        assert!(matches!(
            events.last(),
            Some(CoreEvent::BatchCompleted { batch_id: id }) if *id == batch_id
        ));
    }

    #[tokio::test]
    async fn test_early_completions_are_dropped_once_idle() {
        let fx = fixture();
        let batch_id = fx.orchestrator.start_download(DownloadBatch::multi(links(1))).await;

        // A download this batch never started
        fx.orchestrator
            .download_status_changed(&DownloadDelta::completed(DownloadId(9000)))
            .await;
        assert_eq!(fx.orchestrator.early_completions(), 1);

        complete(&fx, 0).await;
        assert!(fx.orchestrator.batch_progress(batch_id).is_none());
        assert_eq!(fx.orchestrator.early_completions(), 0);

        // Nothing is held while no batch is active
        fx.orchestrator
            .download_status_changed(&DownloadDelta::completed(DownloadId(9001)))
            .await;
        assert_eq!(fx.orchestrator.early_completions(), 0);
    }
}
