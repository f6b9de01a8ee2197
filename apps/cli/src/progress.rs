//! Progress bar utilities for CLI batches

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use linkdrop_types::{CoreEvent, DispatchMode, LaneEnd};
use std::collections::HashMap;
use uuid::Uuid;

/// Manages one progress bar per batch
pub struct BatchProgressBars {
    multi: MultiProgress,
    bars: HashMap<Uuid, ProgressBar>,
    failures: HashMap<Uuid, usize>,
}

impl BatchProgressBars {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
            failures: HashMap::new(),
        }
    }

    fn add_batch(&mut self, batch_id: Uuid, mode: DispatchMode, total: usize) {
        let pb = self.multi.add(ProgressBar::new(total as u64));

        if let Ok(bar_style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(bar_style.progress_chars("█▓▒░  "));
        }

        let mode = match mode {
            DispatchMode::Native => "native",
            DispatchMode::Dom => "dom",
        };
        pb.set_message(format!("{} ({})", short_id(batch_id), mode));
        self.bars.insert(batch_id, pb);
    }

    /// Update the bars from a core event
    pub fn handle_event(&mut self, event: &CoreEvent) {
        match event {
            CoreEvent::BatchStarted {
                batch_id,
                mode,
                total,
            } => self.add_batch(*batch_id, *mode, *total),

            CoreEvent::LinkFinished {
                batch_id,
                index,
                error,
            } => {
                if let Some(pb) = self.bars.get(batch_id) {
                    pb.inc(1);
                    if let Some(error) = error {
                        *self.failures.entry(*batch_id).or_default() += 1;
                        pb.println(format!(
                            "{} link {} failed: {}",
                            style("✗").red().bold(),
                            index,
                            error
                        ));
                    }
                }
            }

            CoreEvent::LaneFinished {
                batch_id,
                reason: LaneEnd::NoExecutionContext,
                ..
            } => {
                if let Some(pb) = self.bars.get(batch_id) {
                    pb.println(format!(
                        "{} No execution context open, batch stopped",
                        style("○").dim()
                    ));
                }
            }

            CoreEvent::LaneFinished {
                batch_id,
                lane,
                reason: LaneEnd::Exceeded,
            } => {
                if let Some(pb) = self.bars.get(batch_id) {
                    pb.println(format!(
                        "{} Lane {} reached the quota limit",
                        style("!").yellow().bold(),
                        lane
                    ));
                }
            }

            CoreEvent::BatchCompleted { batch_id } => {
                if let Some(pb) = self.bars.remove(batch_id) {
                    let failures = self.failures.remove(batch_id).unwrap_or(0);
                    if failures == 0 {
                        pb.finish_with_message(format!(
                            "{} Batch complete",
                            style("✓").green().bold()
                        ));
                    } else {
                        pb.abandon_with_message(format!(
                            "{} Batch complete, {} failed",
                            style("!").yellow().bold(),
                            failures
                        ));
                    }
                }
            }

            _ => {}
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            pb.finish_and_clear();
        }
        self.failures.clear();
    }
}

impl Default for BatchProgressBars {
    fn default() -> Self {
        Self::new()
    }
}

fn short_id(id: Uuid) -> String {
    id.to_string()[..8].to_string()
}
