//! Host bindings
//!
//! The core never talks to the browser directly. Everything it needs from the
//! host (native downloads, declarative session rules, tabs) goes through these
//! traits so the bridge, the simulator and tests can each supply their own.

use async_trait::async_trait;
use linkdrop_types::{ContextId, DownloadId, NativeDownloadRequest, RuleUpdate};
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by a host binding
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("Host is not connected")]
    Disconnected,

    #[error("Host did not answer in time")]
    Timeout,

    #[error("Host rejected the request: {0}")]
    Rejected(String),

    #[error("Malformed host reply: {0}")]
    Protocol(String),
}

/// The host's native download facility
#[async_trait]
pub trait DownloadHost: Send + Sync {
    /// Start a download and return the identifier the host assigned to it
    async fn download(&self, request: NativeDownloadRequest) -> Result<DownloadId, HostError>;
}

/// The host's declarative network-rule engine (session scope)
#[async_trait]
pub trait RuleEngine: Send + Sync {
    /// Apply one atomic add/remove update
    async fn update_session_rules(&self, update: RuleUpdate) -> Result<(), HostError>;

    /// Ids of the session rules the engine currently holds
    async fn session_rule_ids(&self) -> Result<Vec<u32>, HostError> {
        Ok(Vec::new())
    }

    /// Whether calls can reach the engine right now
    fn is_available(&self) -> bool {
        true
    }
}

/// Tabs of the host, including the execution context for DOM-triggered downloads
#[async_trait]
pub trait TabHost: Send + Sync {
    /// An open tab on a trusted origin able to trigger downloads, if any
    async fn find_execution_context(&self) -> Result<Option<ContextId>, HostError>;

    /// Ask the execution context to open `url` as a download; resolves on its acknowledgment
    async fn request_download(&self, context: ContextId, url: &str) -> Result<(), HostError>;

    /// Open `url` in a new tab
    async fn open_tab(&self, url: &str, active: bool) -> Result<(), HostError>;
}

/// The full set of host bindings a core instance runs against
#[derive(Clone)]
pub struct HostBindings {
    pub downloads: Arc<dyn DownloadHost>,
    pub rules: Arc<dyn RuleEngine>,
    pub tabs: Arc<dyn TabHost>,
}

impl HostBindings {
    pub fn new(
        downloads: Arc<dyn DownloadHost>,
        rules: Arc<dyn RuleEngine>,
        tabs: Arc<dyn TabHost>,
    ) -> Self {
        Self {
            downloads,
            rules,
            tabs,
        }
    }

    /// Bind every facility to one host object
    pub fn from_host<H>(host: Arc<H>) -> Self
    where
        H: DownloadHost + RuleEngine + TabHost + 'static,
    {
        Self {
            downloads: host.clone(),
            rules: host.clone(),
            tabs: host,
        }
    }
}
