//! Preview launcher
//!
//! Opens a link in a new tab with its preview header rule installed for the
//! duration of the initial request.

use crate::error::LinkdropError;
use crate::host::TabHost;
use crate::rules::{HeaderPreparer, RuleHandle};
use linkdrop_types::{HeaderSpec, Settings};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Delays around opening a preview tab
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewTiming {
    /// Wait between installing the rule and opening the tab
    pub open_delay: Duration,
    /// How long the rule stays installed after the tab was opened
    pub release_delay: Duration,
}

impl PreviewTiming {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            open_delay: Duration::from_millis(settings.preview_open_delay_ms),
            release_delay: Duration::from_millis(settings.preview_release_delay_ms),
        }
    }
}

#[derive(Clone)]
pub struct PreviewLauncher {
    tabs: Arc<dyn TabHost>,
    headers: HeaderPreparer,
}

impl PreviewLauncher {
    pub fn new(tabs: Arc<dyn TabHost>, headers: HeaderPreparer) -> Self {
        Self { tabs, headers }
    }

    /// Open `url` in an active tab
    ///
    /// The rule is released even when the tab could not be opened; the
    /// returned error only reports the tab failure.
    pub async fn open(
        &self,
        url: &str,
        headers: Option<&HeaderSpec>,
        timing: PreviewTiming,
    ) -> Result<(), LinkdropError> {
        let handle = match headers.and_then(HeaderSpec::for_preview) {
            Some(spec) => match self.headers.prepare(spec, false).await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("Failed to install preview headers for {}: {}", url, e);
                    None
                }
            },
            None => None,
        };

        tokio::time::sleep(timing.open_delay).await;

        debug!(url, "Opening preview");
        let opened = self.tabs.open_tab(url, true).await;

        if let Some(handle) = handle {
            self.release_later(handle, timing.release_delay);
        }

        opened.map_err(LinkdropError::from)
    }

    fn release_later(&self, handle: RuleHandle, delay: Duration) {
        let headers = self.headers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = headers.release(&handle, false).await {
                warn!(id = handle.id, "Failed to release preview headers: {}", e);
            }
        });
    }
}
