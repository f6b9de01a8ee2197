//! Download engine
//!
//! Turns download batches into native downloads or DOM clicks and keeps the
//! per-lane continuation state between host notifications.

mod completion;
mod filename;
mod lanes;
mod orchestrator;
mod sequential;

pub use completion::{CompletionEntry, CompletionTracker, EarlyCompletion};
pub use filename::resolve_filename;
pub use orchestrator::{DownloadOrchestrator, MAX_PARALLEL_DOWNLOADS};
pub use sequential::DomTiming;
