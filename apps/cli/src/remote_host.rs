//! Host bindings backed by the extension's WebSocket
//!
//! Every host call becomes a `{"requestId", "command"}` frame; the extension
//! answers with `{"requestId", "ok", "value" | "error"}`. Calls made while no
//! extension is connected fail immediately.

use async_trait::async_trait;
use linkdrop_core::{DownloadHost, HostError, RuleEngine, TabHost};
use linkdrop_types::{ContextId, DownloadId, NativeDownloadRequest, RuleUpdate};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// How long a host call waits for the extension's reply
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Wire types
// ============================================================================

/// Commands the backend asks the extension to carry out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostCommand {
    #[serde(rename_all = "camelCase")]
    Download {
        url: String,
        filename: String,
        save_as: bool,
    },
    UpdateSessionRules {
        update: RuleUpdate,
    },
    GetSessionRules,
    FindExecutionContext,
    #[serde(rename_all = "camelCase")]
    CreateHref {
        tab_id: ContextId,
        url: String,
    },
    OpenTab {
        url: String,
        active: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRequest {
    pub request_id: u64,
    pub command: HostCommand,
}

/// The extension's answer to a [`HostRequest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostReply {
    pub request_id: u64,
    pub ok: bool,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

// ============================================================================
// Remote host
// ============================================================================

struct Connection {
    generation: u64,
    tx: mpsc::Sender<String>,
}

pub struct RemoteHost {
    connection: Mutex<Option<Connection>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<HostReply>>>,
    next_request_id: AtomicU64,
    next_generation: AtomicU64,
    reply_timeout: Duration,
}

impl RemoteHost {
    pub fn new() -> Self {
        Self::with_timeout(REPLY_TIMEOUT)
    }

    pub fn with_timeout(reply_timeout: Duration) -> Self {
        Self {
            connection: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            reply_timeout,
        }
    }

    /// Route host calls to a freshly connected extension
    ///
    /// Returns the connection's generation for [`RemoteHost::detach`]. A newer
    /// connection replaces an older one.
    pub fn attach(&self, tx: mpsc::Sender<String>) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        *self.connection.lock() = Some(Connection { generation, tx });
        self.pending.lock().clear();
        generation
    }

    /// Forget the connection if it is still the current one
    pub fn detach(&self, generation: u64) {
        let mut connection = self.connection.lock();
        if connection.as_ref().map(|c| c.generation) == Some(generation) {
            *connection = None;
            // Dropping the senders fails every call still waiting on this connection
            self.pending.lock().clear();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    /// Hand a reply to the call waiting for it; stale replies are dropped
    pub fn resolve(&self, reply: HostReply) {
        let waiter = self.pending.lock().remove(&reply.request_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => {
                tracing::debug!(request_id = reply.request_id, "Dropping reply nobody waits for")
            }
        }
    }

    async fn call(&self, command: HostCommand) -> Result<serde_json::Value, HostError> {
        let tx = self
            .connection
            .lock()
            .as_ref()
            .map(|c| c.tx.clone())
            .ok_or(HostError::Disconnected)?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_string(&HostRequest {
            request_id,
            command,
        })
        .map_err(|e| HostError::Protocol(e.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(request_id, reply_tx);

        if tx.send(frame).await.is_err() {
            self.pending.lock().remove(&request_id);
            return Err(HostError::Disconnected);
        }

        let reply = match tokio::time::timeout(self.reply_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(HostError::Disconnected),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                return Err(HostError::Timeout);
            }
        };

        if reply.ok {
            Ok(reply.value)
        } else {
            Err(HostError::Rejected(
                reply.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }

    async fn call_for<T: DeserializeOwned>(&self, command: HostCommand) -> Result<T, HostError> {
        let value = self.call(command).await?;
        serde_json::from_value(value).map_err(|e| HostError::Protocol(e.to_string()))
    }
}

impl Default for RemoteHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DownloadHost for RemoteHost {
    async fn download(&self, request: NativeDownloadRequest) -> Result<DownloadId, HostError> {
        self.call_for(HostCommand::Download {
            url: request.url,
            filename: request.filename,
            save_as: request.save_as,
        })
        .await
    }
}

#[async_trait]
impl RuleEngine for RemoteHost {
    async fn update_session_rules(&self, update: RuleUpdate) -> Result<(), HostError> {
        self.call(HostCommand::UpdateSessionRules { update }).await?;
        Ok(())
    }

    async fn session_rule_ids(&self) -> Result<Vec<u32>, HostError> {
        self.call_for(HostCommand::GetSessionRules).await
    }

    fn is_available(&self) -> bool {
        self.is_connected()
    }
}

#[async_trait]
impl TabHost for RemoteHost {
    async fn find_execution_context(&self) -> Result<Option<ContextId>, HostError> {
        self.call_for(HostCommand::FindExecutionContext).await
    }

    async fn request_download(&self, context: ContextId, url: &str) -> Result<(), HostError> {
        self.call(HostCommand::CreateHref {
            tab_id: context,
            url: url.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn open_tab(&self, url: &str, active: bool) -> Result<(), HostError> {
        self.call(HostCommand::OpenTab {
            url: url.to_string(),
            active,
        })
        .await?;
        Ok(())
    }
}
