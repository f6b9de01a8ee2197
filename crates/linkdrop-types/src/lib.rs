//! Shared types for Linkdrop
//!
//! This crate contains the data structures exchanged between the browser
//! extension, the bridge server, the CLI and the core library. Field names
//! follow the extension's camelCase JSON so messages pass through unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// URL value signalling that the user's quota is exhausted.
pub const EXCEEDED_URL: &str = "exceeded";

// ============================================================================
// Link Types
// ============================================================================

/// A single downloadable link discovered on a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkDescriptor {
    pub url: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_extension_version: Option<String>,
}

impl LinkDescriptor {
    pub fn new(url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: filename.into(),
            file_type: None,
            folder: None,
            min_extension_version: None,
        }
    }

    /// A descriptor carrying the quota sentinel instead of a real URL
    pub fn exceeded() -> Self {
        Self::new(EXCEEDED_URL, "")
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    /// Whether this link is the quota sentinel
    pub fn is_exceeded(&self) -> bool {
        self.url == EXCEEDED_URL
    }
}

/// Whether a batch came from a single download button or a "download all" action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    Single,
    Multi,
}

/// An ordered batch of links to download
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadBatch {
    pub kind: BatchKind,
    pub links: Vec<LinkDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderSpec>,
}

impl DownloadBatch {
    pub fn single(link: LinkDescriptor) -> Self {
        Self {
            kind: BatchKind::Single,
            links: vec![link],
            headers: None,
        }
    }

    pub fn multi(links: Vec<LinkDescriptor>) -> Self {
        Self {
            kind: BatchKind::Multi,
            links,
            headers: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderSpec) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

// ============================================================================
// Header Rule Types
// ============================================================================

/// Per-operation header rules attached to a batch or preview request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<HeaderRuleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<HeaderRuleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub both: Option<HeaderRuleSpec>,
}

impl HeaderSpec {
    /// Rule that must ride along with downloads: `download` first, then `both`
    pub fn for_download(&self) -> Option<&HeaderRuleSpec> {
        Self::first_non_empty(&self.download, &self.both)
    }

    /// Rule that must ride along with previews: `preview` first, then `both`
    pub fn for_preview(&self) -> Option<&HeaderRuleSpec> {
        Self::first_non_empty(&self.preview, &self.both)
    }

    fn first_non_empty<'a>(
        scoped: &'a Option<HeaderRuleSpec>,
        both: &'a Option<HeaderRuleSpec>,
    ) -> Option<&'a HeaderRuleSpec> {
        scoped
            .as_ref()
            .filter(|spec| !spec.is_empty())
            .or_else(|| both.as_ref().filter(|spec| !spec.is_empty()))
    }
}

/// A header action paired with the requests it applies to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRuleSpec {
    pub action: RuleAction,
    #[serde(default)]
    pub condition: RuleCondition,
}

impl HeaderRuleSpec {
    pub fn new(action: RuleAction, condition: RuleCondition) -> Self {
        Self { action, condition }
    }

    /// A spec that modifies no headers at all
    pub fn is_empty(&self) -> bool {
        self.action.is_empty()
    }
}

/// The declarative action of a session rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAction {
    #[serde(rename = "type", default)]
    pub kind: RuleActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<Vec<ModifyHeaderInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Vec<ModifyHeaderInfo>>,
}

impl RuleAction {
    pub fn modify_request(headers: Vec<ModifyHeaderInfo>) -> Self {
        Self {
            kind: RuleActionType::ModifyHeaders,
            request_headers: Some(headers),
            response_headers: None,
        }
    }

    pub fn modify_response(headers: Vec<ModifyHeaderInfo>) -> Self {
        Self {
            kind: RuleActionType::ModifyHeaders,
            request_headers: None,
            response_headers: Some(headers),
        }
    }

    pub fn is_empty(&self) -> bool {
        let none = |headers: &Option<Vec<ModifyHeaderInfo>>| {
            headers.as_ref().map(Vec::is_empty).unwrap_or(true)
        };
        none(&self.request_headers) && none(&self.response_headers)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleActionType {
    #[default]
    ModifyHeaders,
}

/// One header modification inside a rule action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyHeaderInfo {
    pub header: String,
    pub operation: HeaderOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ModifyHeaderInfo {
    pub fn set(header: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            operation: HeaderOperation::Set,
            value: Some(value.into()),
        }
    }

    pub fn remove(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            operation: HeaderOperation::Remove,
            value: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderOperation {
    Set,
    Append,
    Remove,
}

/// Which requests a session rule matches
///
/// Unknown condition keys are kept in `extra` so they reach the host untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_domains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_domains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_methods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_ids: Option<Vec<i64>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RuleCondition {
    pub fn url_filter(filter: impl Into<String>) -> Self {
        Self {
            url_filter: Some(filter.into()),
            ..Self::default()
        }
    }
}

/// A rule as installed with the host's declarative network-rule engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRule {
    pub id: u32,
    pub priority: u32,
    pub action: RuleAction,
    pub condition: RuleCondition,
}

/// One atomic update of the host's session rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleUpdate {
    #[serde(default)]
    pub add_rules: Vec<SessionRule>,
    #[serde(default)]
    pub remove_rule_ids: Vec<u32>,
}

impl RuleUpdate {
    /// Install `rule`, retiring whatever was registered under its id
    pub fn replace(rule: SessionRule) -> Self {
        Self {
            remove_rule_ids: vec![rule.id],
            add_rules: vec![rule],
        }
    }

    pub fn remove(ids: Vec<u32>) -> Self {
        Self {
            add_rules: Vec::new(),
            remove_rule_ids: ids,
        }
    }
}

// ============================================================================
// Host Download Types
// ============================================================================

/// Identifier the host assigns to a native download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(pub u64);

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request for the host's native download facility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeDownloadRequest {
    pub url: String,
    pub filename: String,
    pub save_as: bool,
}

/// A change notification for a native download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadDelta {
    pub id: DownloadId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl DownloadDelta {
    pub fn completed(id: DownloadId) -> Self {
        Self {
            id,
            error: None,
            end_time: Some(Utc::now()),
        }
    }

    pub fn failed(id: DownloadId, error: impl Into<String>) -> Self {
        Self {
            id,
            error: Some(error.into()),
            end_time: None,
        }
    }

    /// The download ended, successfully or not
    pub fn is_terminal(&self) -> bool {
        self.error.is_some() || self.end_time.is_some()
    }
}

/// Identifier of an execution context (an open tab) in the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub i64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Orchestration Types
// ============================================================================

/// How a batch is downloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Host download facility, up to ten lanes
    Native,
    /// Execution-context click with a scoped header rule, one link at a time
    Dom,
}

/// Why a lane stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LaneEnd {
    /// Ran past the end of the batch
    Exhausted,
    /// Hit the quota sentinel
    Exceeded,
    /// No execution context was open
    NoExecutionContext,
}

/// Current position of one lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum LaneState {
    Idle,
    InFlight { index: usize },
    Finished { reason: LaneEnd },
}

impl LaneState {
    pub fn is_finished(&self) -> bool {
        matches!(self, LaneState::Finished { .. })
    }
}

/// Snapshot of a batch that is still draining
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub id: Uuid,
    pub mode: DispatchMode,
    pub total: usize,
    pub finished_links: usize,
    pub lanes: Vec<LaneState>,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Backend settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Create the link's folder for single downloads
    pub per_file_folder: bool,
    /// Create the link's folder for "download all" batches
    pub batch_folder: bool,
    /// How long a DOM download's header rule stays installed after the click
    pub rule_release_delay_ms: u64,
    /// Pause between two DOM-triggered downloads
    pub next_dispatch_delay_ms: u64,
    /// Delay before a preview tab is opened
    pub preview_open_delay_ms: u64,
    /// How long a preview's header rule stays installed after the tab opened
    pub preview_release_delay_ms: u64,
    /// Origins allowed to install permanent headers and host execution contexts
    pub trusted_origins: Vec<String>,
    /// Port of the extension bridge
    pub bridge_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            per_file_folder: false,
            batch_folder: true,
            rule_release_delay_ms: 200,
            next_dispatch_delay_ms: 500,
            preview_open_delay_ms: 100,
            preview_release_delay_ms: 200,
            trusted_origins: Vec::new(),
            bridge_port: 7899,
        }
    }
}

impl Settings {
    /// Whether links of a batch of this kind go into their own folder
    pub fn create_folder(&self, kind: BatchKind) -> bool {
        match kind {
            BatchKind::Single => self.per_file_folder,
            BatchKind::Multi => self.batch_folder,
        }
    }

    pub fn set_option(&mut self, name: OptionName, value: bool) {
        match name {
            OptionName::PerFileFolder => self.per_file_folder = value,
            OptionName::BatchFolder => self.batch_folder = value,
        }
    }
}

/// Options the extension's options page can toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionName {
    #[serde(rename = "perFileFolder", alias = "btDlFolder")]
    PerFileFolder,
    #[serde(rename = "batchFolder", alias = "btDlAllFolder")]
    BatchFolder,
}

// ============================================================================
// Message Types
// ============================================================================

/// Messages the extension sends to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExtensionMessage {
    StartDownload {
        batch: DownloadBatch,
    },
    DownloadChanged {
        delta: DownloadDelta,
    },
    Preview {
        url: String,
        #[serde(default)]
        headers: Option<HeaderSpec>,
    },
    SetOption {
        name: OptionName,
        value: bool,
    },
    SetHeaders {
        origin: String,
        headers: Vec<HeaderRuleSpec>,
    },
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    BatchStarted {
        batch_id: Uuid,
        mode: DispatchMode,
        total: usize,
    },
    LinkDispatched {
        batch_id: Uuid,
        index: usize,
        download_id: Option<DownloadId>,
    },
    LinkFinished {
        batch_id: Uuid,
        index: usize,
        error: Option<String>,
    },
    LaneFinished {
        batch_id: Uuid,
        lane: usize,
        reason: LaneEnd,
    },
    BatchCompleted {
        batch_id: Uuid,
    },
    RuleInstalled {
        id: u32,
        fingerprint: i32,
        permanent: bool,
    },
    RuleRemoved {
        id: u32,
        fingerprint: i32,
    },
    Error {
        message: String,
        context: Option<String>,
    },
}
