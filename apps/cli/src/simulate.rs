//! In-process simulated browser host
//!
//! Lets a batch run end to end without a browser: downloads "finish" after a
//! configurable latency, every n-th one fails, and an execution context can be
//! switched off to exercise the silent DOM stop.

use async_trait::async_trait;
use linkdrop_core::{DownloadHost, HostError, RuleEngine, TabHost};
use linkdrop_types::{ContextId, DownloadDelta, DownloadId, NativeDownloadRequest, RuleUpdate};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Behaviour of the simulated host
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Time a native download takes to finish
    pub latency: Duration,
    /// Fail every n-th native download
    pub fail_every: Option<u64>,
    /// Whether a trusted tab is open for DOM downloads
    pub execution_context: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(300),
            fail_every: None,
            execution_context: true,
        }
    }
}

pub struct SimHost {
    config: SimConfig,
    next_id: AtomicU64,
    deltas: mpsc::UnboundedSender<DownloadDelta>,
    session_rules: Mutex<BTreeSet<u32>>,
    clicks: Mutex<Vec<String>>,
}

impl SimHost {
    /// Create a host; terminal download changes arrive on the returned receiver
    pub fn new(config: SimConfig) -> (Self, mpsc::UnboundedReceiver<DownloadDelta>) {
        let (deltas, rx) = mpsc::unbounded_channel();
        let host = Self {
            config,
            next_id: AtomicU64::new(1),
            deltas,
            session_rules: Mutex::new(BTreeSet::new()),
            clicks: Mutex::new(Vec::new()),
        };
        (host, rx)
    }

    pub fn session_rules(&self) -> Vec<u32> {
        self.session_rules.lock().iter().copied().collect()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.clicks.lock().clone()
    }
}

#[async_trait]
impl DownloadHost for SimHost {
    async fn download(&self, request: NativeDownloadRequest) -> Result<DownloadId, HostError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = DownloadId(n);
        let fails = self.config.fail_every.is_some_and(|every| every > 0 && n % every == 0);

        tracing::debug!(
            %id,
            url = %request.url,
            filename = %request.filename,
            "Simulated download started"
        );

        let deltas = self.deltas.clone();
        let latency = self.config.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let delta = if fails {
                DownloadDelta::failed(id, "SIMULATED_FAILURE")
            } else {
                DownloadDelta::completed(id)
            };
            let _ = deltas.send(delta);
        });

        Ok(id)
    }
}

#[async_trait]
impl RuleEngine for SimHost {
    async fn update_session_rules(&self, update: RuleUpdate) -> Result<(), HostError> {
        let mut rules = self.session_rules.lock();
        for id in &update.remove_rule_ids {
            rules.remove(id);
        }
        for rule in &update.add_rules {
            rules.insert(rule.id);
        }
        Ok(())
    }

    async fn session_rule_ids(&self) -> Result<Vec<u32>, HostError> {
        Ok(self.session_rules())
    }
}

#[async_trait]
impl TabHost for SimHost {
    async fn find_execution_context(&self) -> Result<Option<ContextId>, HostError> {
        Ok(self.config.execution_context.then_some(ContextId(1)))
    }

    async fn request_download(&self, _context: ContextId, url: &str) -> Result<(), HostError> {
        tracing::debug!(url, "Simulated click");
        self.clicks.lock().push(url.to_string());
        Ok(())
    }

    async fn open_tab(&self, url: &str, _active: bool) -> Result<(), HostError> {
        tracing::debug!(url, "Simulated tab opened");
        Ok(())
    }
}
