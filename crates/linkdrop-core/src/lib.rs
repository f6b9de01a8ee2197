//! Linkdrop Core - Download Orchestration
//!
//! This crate drives batches of links to completion through a browser host.
//! It handles parallel native downloads, header-rewriting DOM downloads,
//! previews, and the lifecycle of the session header rules they need.

mod engine;
mod error;
mod host;
mod preview;
mod rules;
mod storage;

#[cfg(test)]
mod test_support;

pub use engine::*;
pub use error::*;
pub use host::*;
pub use preview::*;
pub use rules::*;
pub use storage::*;

use linkdrop_types::{
    BatchProgress, CoreEvent, DownloadBatch, DownloadDelta, ExtensionMessage, HeaderRuleSpec,
    HeaderSpec, OptionName, Settings,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// The main Linkdrop core instance
pub struct LinkdropCore {
    /// Backend settings
    pub settings: Arc<RwLock<Settings>>,
    /// Settings persistence, absent for in-memory instances
    storage: Option<Storage>,
    /// Installed header rules
    rules: Arc<RuleStore>,
    headers: HeaderPreparer,
    orchestrator: DownloadOrchestrator,
    preview: PreviewLauncher,
    /// Event broadcaster
    event_tx: broadcast::Sender<CoreEvent>,
}

impl LinkdropCore {
    /// Create a core instance running against `hosts`
    ///
    /// Rules left behind by a previous incarnation are flushed before this
    /// returns, unless the rule engine cannot be reached yet.
    pub async fn new(hosts: HostBindings, settings: Settings) -> Self {
        Self::build(hosts, settings, None).await
    }

    /// Create a core instance whose settings are loaded from and saved to `data_dir`
    pub async fn with_storage(
        hosts: HostBindings,
        data_dir: PathBuf,
    ) -> Result<Self, LinkdropError> {
        let storage = Storage::new(data_dir).await?;
        let settings = storage.load_settings().await;
        Ok(Self::build(hosts, settings, Some(storage)).await)
    }

    async fn build(hosts: HostBindings, settings: Settings, storage: Option<Storage>) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        let settings = Arc::new(RwLock::new(settings));
        let rules_reachable = hosts.rules.is_available();

        let rules = Arc::new(RuleStore::new(hosts.rules.clone(), event_tx.clone()));
        let headers = HeaderPreparer::new(rules.clone());
        let orchestrator =
            DownloadOrchestrator::new(&hosts, headers.clone(), settings.clone(), event_tx.clone());
        let preview = PreviewLauncher::new(hosts.tabs.clone(), headers.clone());

        let core = Self {
            settings,
            storage,
            rules,
            headers,
            orchestrator,
            preview,
            event_tx,
        };

        if rules_reachable {
            if let Err(e) = core.flush_rules().await {
                warn!("Failed to flush header rules on start: {}", e);
            }
        } else {
            debug!("Rule engine not reachable yet, skipping the startup flush");
        }
        core
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    /// Emit an event
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.event_tx.send(event);
    }

    // ========================================================================
    // Download Operations
    // ========================================================================

    /// Start downloading a batch of links
    pub async fn start_download(&self, batch: DownloadBatch) -> Uuid {
        self.orchestrator.start_download(batch).await
    }

    /// Feed a download status change reported by the host
    pub async fn download_status_changed(&self, delta: &DownloadDelta) {
        self.orchestrator.download_status_changed(delta).await
    }

    /// Progress of a batch that is still draining
    pub fn batch_progress(&self, batch_id: Uuid) -> Result<BatchProgress, LinkdropError> {
        self.orchestrator
            .batch_progress(batch_id)
            .ok_or(LinkdropError::NotFound(batch_id))
    }

    pub fn active_batches(&self) -> Vec<BatchProgress> {
        self.orchestrator.active_batches()
    }

    // ========================================================================
    // Preview
    // ========================================================================

    /// Open `url` in a new tab with its preview headers installed
    pub async fn open_preview(
        &self,
        url: &str,
        headers: Option<&HeaderSpec>,
    ) -> Result<(), LinkdropError> {
        let timing = PreviewTiming::from_settings(&*self.settings.read().await);
        self.preview.open(url, headers, timing).await
    }

    // ========================================================================
    // Header Rules
    // ========================================================================

    /// Install header rules that stay until the next forced flush
    ///
    /// Only origins listed in the trusted origins may do this.
    pub async fn set_permanent_headers(
        &self,
        origin: &str,
        specs: &[HeaderRuleSpec],
    ) -> Result<Vec<RuleHandle>, LinkdropError> {
        if !self.is_trusted_origin(origin).await {
            return Err(LinkdropError::UntrustedOrigin(origin.to_string()));
        }
        if specs.iter().any(HeaderRuleSpec::is_empty) {
            return Err(LinkdropError::InvalidOperation(
                "permanent header rule modifies no headers".to_string(),
            ));
        }

        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            handles.push(self.headers.prepare(spec, true).await?);
        }

        info!(origin, "Installed {} permanent header rules", handles.len());
        Ok(handles)
    }

    /// Whether `origin` matches one of the trusted origins
    pub async fn is_trusted_origin(&self, origin: &str) -> bool {
        let Ok(candidate) = Url::parse(origin) else {
            return false;
        };

        self.settings
            .read()
            .await
            .trusted_origins
            .iter()
            .filter_map(|trusted| Url::parse(trusted).ok())
            .any(|trusted| trusted.origin() == candidate.origin())
    }

    /// Remove every installed rule plus any the host still holds from an earlier session
    pub async fn flush_rules(&self) -> Result<(), LinkdropError> {
        let result = self.rules.flush_on_start().await;
        if let Err(e) = &result {
            self.emit(CoreEvent::Error {
                message: e.to_string(),
                context: Some("flush header rules".to_string()),
            });
        }
        result
    }

    /// Snapshot of the installed rules
    pub fn rules(&self) -> Vec<HeaderRule> {
        self.rules.rules()
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Get current settings
    pub async fn get_settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Update settings; subsequent batches pick them up
    pub async fn update_settings(&self, settings: Settings) -> Result<(), LinkdropError> {
        *self.settings.write().await = settings.clone();
        self.persist(&settings).await
    }

    /// Toggle one option; subsequent batches pick it up
    pub async fn set_option(&self, name: OptionName, value: bool) -> Result<(), LinkdropError> {
        let settings = {
            let mut settings = self.settings.write().await;
            settings.set_option(name, value);
            settings.clone()
        };
        self.persist(&settings).await
    }

    async fn persist(&self, settings: &Settings) -> Result<(), LinkdropError> {
        match &self.storage {
            Some(storage) => storage.save_settings(settings).await,
            None => Ok(()),
        }
    }

    // ========================================================================
    // Extension Messages
    // ========================================================================

    /// Dispatch a message from the extension; returns the batch id for downloads
    pub async fn handle_message(
        &self,
        message: ExtensionMessage,
    ) -> Result<Option<Uuid>, LinkdropError> {
        match message {
            ExtensionMessage::StartDownload { batch } => Ok(Some(self.start_download(batch).await)),
            ExtensionMessage::DownloadChanged { delta } => {
                self.download_status_changed(&delta).await;
                Ok(None)
            }
            ExtensionMessage::Preview { url, headers } => {
                self.open_preview(&url, headers.as_ref()).await?;
                Ok(None)
            }
            ExtensionMessage::SetOption { name, value } => {
                self.set_option(name, value).await?;
                Ok(None)
            }
            ExtensionMessage::SetHeaders { origin, headers } => {
                self.set_permanent_headers(&origin, &headers).await?;
                Ok(None)
            }
        }
    }
}
