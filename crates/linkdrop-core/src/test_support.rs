//! Recording host bindings for unit tests

use crate::host::{DownloadHost, HostBindings, HostError, RuleEngine, TabHost};
use async_trait::async_trait;
use linkdrop_types::{ContextId, DownloadId, NativeDownloadRequest, RuleUpdate};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

// ============================================================================
// Rule engine
// ============================================================================

#[derive(Default)]
pub(crate) struct RecordingRuleEngine {
    updates: Mutex<Vec<(Instant, RuleUpdate)>>,
    installed: Mutex<BTreeSet<u32>>,
    fail_next: Mutex<Option<HostError>>,
    offline: AtomicBool,
}

impl RecordingRuleEngine {
    /// An engine still holding rules from a previous session
    pub fn with_leftovers(ids: Vec<u32>) -> Self {
        let engine = Self::default();
        engine.installed.lock().extend(ids);
        engine
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_next(&self, error: HostError) {
        *self.fail_next.lock() = Some(error);
    }

    pub fn updates(&self) -> Vec<RuleUpdate> {
        self.updates.lock().iter().map(|(_, u)| u.clone()).collect()
    }

    pub fn timed_updates(&self) -> Vec<(Instant, RuleUpdate)> {
        self.updates.lock().clone()
    }

    pub fn installed_ids(&self) -> Vec<u32> {
        self.installed.lock().iter().copied().collect()
    }
}

#[async_trait]
impl RuleEngine for RecordingRuleEngine {
    async fn update_session_rules(&self, update: RuleUpdate) -> Result<(), HostError> {
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }

        {
            let mut installed = self.installed.lock();
            for id in &update.remove_rule_ids {
                installed.remove(id);
            }
            for rule in &update.add_rules {
                installed.insert(rule.id);
            }
        }
        self.updates.lock().push((Instant::now(), update));
        Ok(())
    }

    async fn session_rule_ids(&self) -> Result<Vec<u32>, HostError> {
        Ok(self.installed_ids())
    }

    fn is_available(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Download host
// ============================================================================

pub(crate) struct RecordingDownloadHost {
    next_id: AtomicU64,
    calls: Mutex<Vec<(Option<DownloadId>, NativeDownloadRequest)>>,
    failing_urls: Mutex<HashSet<String>>,
}

impl Default for RecordingDownloadHost {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            calls: Mutex::new(Vec::new()),
            failing_urls: Mutex::new(HashSet::new()),
        }
    }
}

impl RecordingDownloadHost {
    /// Make the host refuse to start downloads of `url`
    pub fn fail_url(&self, url: &str) {
        self.failing_urls.lock().insert(url.to_string());
    }

    pub fn requests(&self) -> Vec<NativeDownloadRequest> {
        self.calls.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn dispatched_urls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(_, r)| r.url.clone()).collect()
    }

    /// Id assigned to the most recent successful download of `url`
    pub fn id_for(&self, url: &str) -> Option<DownloadId> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find(|(id, r)| id.is_some() && r.url == url)
            .and_then(|(id, _)| *id)
    }
}

#[async_trait]
impl DownloadHost for RecordingDownloadHost {
    async fn download(&self, request: NativeDownloadRequest) -> Result<DownloadId, HostError> {
        if self.failing_urls.lock().contains(&request.url) {
            self.calls.lock().push((None, request));
            return Err(HostError::Rejected("invalid url".into()));
        }

        let id = DownloadId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.calls.lock().push((Some(id), request));
        Ok(id)
    }
}

// ============================================================================
// Tab host
// ============================================================================

#[derive(Default)]
pub(crate) struct RecordingTabHost {
    context: Mutex<Option<ContextId>>,
    clicks: Mutex<Vec<(Instant, String)>>,
    opened: Mutex<Vec<(Instant, String, bool)>>,
}

impl RecordingTabHost {
    pub fn with_context(id: i64) -> Self {
        let host = Self::default();
        *host.context.lock() = Some(ContextId(id));
        host
    }

    pub fn close_context(&self) {
        *self.context.lock() = None;
    }

    pub fn clicks(&self) -> Vec<(Instant, String)> {
        self.clicks.lock().clone()
    }

    pub fn opened(&self) -> Vec<(Instant, String, bool)> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl TabHost for RecordingTabHost {
    async fn find_execution_context(&self) -> Result<Option<ContextId>, HostError> {
        Ok(*self.context.lock())
    }

    async fn request_download(&self, _context: ContextId, url: &str) -> Result<(), HostError> {
        self.clicks.lock().push((Instant::now(), url.to_string()));
        Ok(())
    }

    async fn open_tab(&self, url: &str, active: bool) -> Result<(), HostError> {
        self.opened.lock().push((Instant::now(), url.to_string(), active));
        Ok(())
    }
}

// ============================================================================
// Bundle
// ============================================================================

pub(crate) struct TestHost {
    pub downloads: Arc<RecordingDownloadHost>,
    pub rules: Arc<RecordingRuleEngine>,
    pub tabs: Arc<RecordingTabHost>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::with_tabs(RecordingTabHost::default())
    }

    pub fn with_tabs(tabs: RecordingTabHost) -> Self {
        Self {
            downloads: Arc::new(RecordingDownloadHost::default()),
            rules: Arc::new(RecordingRuleEngine::default()),
            tabs: Arc::new(tabs),
        }
    }

    pub fn bindings(&self) -> HostBindings {
        HostBindings::new(self.downloads.clone(), self.rules.clone(), self.tabs.clone())
    }
}
