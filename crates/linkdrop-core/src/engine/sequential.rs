//! Sequential DOM dispatch
//!
//! Batches that need custom headers cannot use the host download facility,
//! so each link is clicked inside an execution context while a header rule
//! carrying the target filename is installed. One link at a time.

use super::lanes::LinkStep;
use super::orchestrator::DownloadOrchestrator;
use crate::rules::RuleHandle;
use linkdrop_types::{HeaderRuleSpec, LaneEnd, ModifyHeaderInfo, Settings};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// The only lane of a DOM batch
const DOM_LANE: usize = 0;

/// Delays of the sequential loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomTiming {
    /// How long the header rule stays installed after the click was acknowledged
    pub rule_release_delay: Duration,
    /// Pause between an acknowledged click and the next link
    pub next_dispatch_delay: Duration,
}

impl DomTiming {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            rule_release_delay: Duration::from_millis(settings.rule_release_delay_ms),
            next_dispatch_delay: Duration::from_millis(settings.next_dispatch_delay_ms),
        }
    }
}

impl Default for DomTiming {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl DownloadOrchestrator {
    pub(crate) async fn run_sequential(
        self,
        batch_id: Uuid,
        rule: HeaderRuleSpec,
        timing: DomTiming,
    ) {
        let mut index = 0;

        loop {
            let (link, filename) = match self.claim(batch_id, DOM_LANE, index) {
                LinkStep::Dispatch { link, filename } => (link, filename),
                LinkStep::End(reason) => {
                    self.finish_lane(batch_id, DOM_LANE, reason);
                    return;
                }
                LinkStep::Gone => return,
            };

            let context = match self.tabs().find_execution_context().await {
                Ok(Some(context)) => context,
                Ok(None) => {
                    debug!(%batch_id, index, "No execution context open, stopping batch");
                    self.finish_lane(batch_id, DOM_LANE, LaneEnd::NoExecutionContext);
                    return;
                }
                Err(e) => {
                    warn!(%batch_id, "Failed to look up execution context: {}", e);
                    self.finish_lane(batch_id, DOM_LANE, LaneEnd::NoExecutionContext);
                    return;
                }
            };

            let mut action = rule.action.clone();
            action.response_headers = Some(vec![ModifyHeaderInfo::set(
                "content-disposition",
                format!("attachment; filename={}", filename),
            )]);

            let handle = match self
                .headers()
                .prepare_action(action, rule.condition.clone(), false)
                .await
            {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(%batch_id, index, "Failed to install download headers: {}", e);
                    None
                }
            };

            self.link_dispatched(batch_id, index);
            debug!(%batch_id, index, %context, "Requesting DOM download");

            let error = match self.tabs().request_download(context, &link.url).await {
                Ok(()) => None,
                Err(e) => {
                    warn!(
                        %batch_id,
                        index,
                        "Execution context did not acknowledge download: {}", e
                    );
                    Some(e.to_string())
                }
            };
            self.link_finished(batch_id, index, error);

            if let Some(handle) = handle {
                self.release_later(handle, timing.rule_release_delay);
            }

            tokio::time::sleep(timing.next_dispatch_delay).await;
            index += 1;
        }
    }

    fn release_later(&self, handle: RuleHandle, delay: Duration) {
        let headers = self.headers().clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = headers.release(&handle, false).await {
                warn!(id = handle.id, "Failed to release download headers: {}", e);
            }
        });
    }
}
