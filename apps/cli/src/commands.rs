//! CLI command implementations

use crate::bridge::BridgeServer;
use crate::output::{format_delay, print_output};
use crate::progress::BatchProgressBars;
use crate::remote_host::RemoteHost;
use crate::simulate::{SimConfig, SimHost};
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, Result};
use console::style;
use linkdrop_core::{HostBindings, LinkdropCore, Storage};
use linkdrop_types::{
    CoreEvent, DispatchMode, DownloadBatch, HeaderRuleSpec, HeaderSpec, LinkDescriptor,
    ModifyHeaderInfo, RuleAction, RuleCondition, Settings,
};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// Serve
// ============================================================================

pub async fn serve(data_dir: PathBuf, port: Option<u16>) -> Result<()> {
    let host = Arc::new(RemoteHost::new());
    let core = LinkdropCore::with_storage(HostBindings::from_host(host.clone()), data_dir).await?;
    let port = match port {
        Some(port) => port,
        None => core.get_settings().await.bridge_port,
    };

    println!(
        "{} Waiting for the extension on http://127.0.0.1:{}",
        style("●").green().bold(),
        port
    );

    BridgeServer::new(Arc::new(core), host, port)
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down extension bridge");
        })
        .await
}

// ============================================================================
// Simulate
// ============================================================================

/// Options of the `simulate` command
pub struct SimulateOptions {
    pub file: Option<PathBuf>,
    pub links: usize,
    pub dom: bool,
    pub latency_ms: u64,
    pub fail_every: Option<u64>,
    pub no_context: bool,
}

/// Outcome of a simulated batch
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSummary {
    pub batch_id: Uuid,
    pub mode: DispatchMode,
    pub total: usize,
    pub finished: usize,
    pub failed: usize,
    pub dom_clicks: usize,
    pub leftover_rules: usize,
}

impl fmt::Display for SimulationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Batch {} ({:?})", self.batch_id, self.mode)?;
        writeln!(f, "  Links:    {}/{} finished", self.finished, self.total)?;
        writeln!(f, "  Failed:   {}", self.failed)?;
        if self.mode == DispatchMode::Dom {
            writeln!(f, "  Clicks:   {}", self.dom_clicks)?;
        }
        write!(f, "  Leftover rules: {}", self.leftover_rules)
    }
}

pub async fn simulate(
    data_dir: PathBuf,
    options: SimulateOptions,
    format: OutputFormat,
) -> Result<()> {
    let settings = Storage::new(data_dir).await?.load_settings().await;
    let batch = load_batch(&options).await?;

    let (host, mut deltas) = SimHost::new(SimConfig {
        latency: Duration::from_millis(options.latency_ms),
        fail_every: options.fail_every,
        execution_context: !options.no_context,
    });
    let host = Arc::new(host);
    let core = LinkdropCore::new(HostBindings::from_host(host.clone()), settings).await;
    let mut events = core.subscribe();
    let mut bars = matches!(format, OutputFormat::Human).then(BatchProgressBars::new);

    let total = batch.len();
    let batch_id = core.start_download(batch).await;

    let mut mode = DispatchMode::Native;
    let mut finished = 0;
    let mut failed = 0;
    loop {
        tokio::select! {
            Some(delta) = deltas.recv() => core.download_status_changed(&delta).await,
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Progress display skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Some(bars) = bars.as_mut() {
                    bars.handle_event(&event);
                }
                match event {
                    CoreEvent::BatchStarted {
                        batch_id: id,
                        mode: started,
                        ..
                    } if id == batch_id => {
                        mode = started;
                    }
                    CoreEvent::LinkFinished { batch_id: id, error, .. } if id == batch_id => {
                        finished += 1;
                        if error.is_some() {
                            failed += 1;
                        }
                    }
                    CoreEvent::BatchCompleted { batch_id: id } if id == batch_id => break,
                    _ => {}
                }
            }
        }
    }

    // Let the last delayed rule release land
    let settings = core.get_settings().await;
    tokio::time::sleep(Duration::from_millis(settings.rule_release_delay_ms + 50)).await;
    if let Some(bars) = bars.as_mut() {
        bars.clear();
    }

    let summary = SimulationSummary {
        batch_id,
        mode,
        total,
        finished,
        failed,
        dom_clicks: host.clicks().len(),
        leftover_rules: host.session_rules().len(),
    };
    print_output(&summary, format)
}

async fn load_batch(options: &SimulateOptions) -> Result<DownloadBatch> {
    let mut batch = match &options.file {
        Some(path) => {
            let content = tokio::fs::read_to_string(path).await?;
            serde_json::from_str::<DownloadBatch>(&content)
                .map_err(|e| anyhow!("Invalid batch file {}: {}", path.display(), e))?
        }
        None => DownloadBatch::multi(
            (0..options.links)
                .map(|i| {
                    LinkDescriptor::new(
                        format!("https://cdn.example.com/file-{}.bin", i),
                        format!("file-{}.bin", i),
                    )
                    .with_folder("Simulated")
                })
                .collect(),
        ),
    };

    if options.dom {
        batch.headers = Some(HeaderSpec {
            download: Some(HeaderRuleSpec::new(
                RuleAction::modify_request(vec![ModifyHeaderInfo::set(
                    "referer",
                    "https://cdn.example.com/",
                )]),
                RuleCondition::url_filter("cdn.example.com"),
            )),
            ..HeaderSpec::default()
        });
    }

    Ok(batch)
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    data_dir: PathBuf,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    let storage = Storage::new(data_dir).await?;

    match action {
        None | Some(ConfigAction::Show) => {
            let settings = storage.load_settings().await;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                OutputFormat::Table => {
                    use tabled::{Table, Tabled};

                    #[derive(Tabled)]
                    struct SettingRow {
                        key: &'static str,
                        value: String,
                    }

                    let rows: Vec<SettingRow> = settings_entries(&settings)
                        .into_iter()
                        .map(|(key, value)| SettingRow { key, value })
                        .collect();

                    println!("{}", Table::new(rows));
                }
                OutputFormat::Human => {
                    println!("Linkdrop Configuration:");
                    println!();
                    println!("  Per-file folder: {}", settings.per_file_folder);
                    println!("  Batch folder: {}", settings.batch_folder);
                    println!(
                        "  DOM rule release delay: {}",
                        format_delay(settings.rule_release_delay_ms)
                    );
                    println!(
                        "  DOM next download delay: {}",
                        format_delay(settings.next_dispatch_delay_ms)
                    );
                    println!(
                        "  Preview open delay: {}",
                        format_delay(settings.preview_open_delay_ms)
                    );
                    println!(
                        "  Preview release delay: {}",
                        format_delay(settings.preview_release_delay_ms)
                    );
                    if settings.trusted_origins.is_empty() {
                        println!("  Trusted origins: none");
                    } else {
                        println!("  Trusted origins: {}", settings.trusted_origins.join(", "));
                    }
                    println!("  Bridge port: {}", settings.bridge_port);
                    println!("  File: {}", storage.settings_path().display());
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = storage.load_settings().await;
            let value = settings_entries(&settings)
                .into_iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value)
                .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
            println!("{}", value);
        }

        Some(ConfigAction::Set { key, value }) => {
            let mut settings = storage.load_settings().await;
            apply_setting(&mut settings, &key, &value)?;
            storage.save_settings(&settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset) => {
            use dialoguer::Confirm;

            let confirmed = Confirm::new()
                .with_prompt("Reset all settings to defaults?")
                .default(false)
                .interact()?;

            if confirmed {
                storage.save_settings(&Settings::default()).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}

fn settings_entries(settings: &Settings) -> Vec<(&'static str, String)> {
    vec![
        ("perFileFolder", settings.per_file_folder.to_string()),
        ("batchFolder", settings.batch_folder.to_string()),
        ("ruleReleaseDelayMs", settings.rule_release_delay_ms.to_string()),
        ("nextDispatchDelayMs", settings.next_dispatch_delay_ms.to_string()),
        ("previewOpenDelayMs", settings.preview_open_delay_ms.to_string()),
        ("previewReleaseDelayMs", settings.preview_release_delay_ms.to_string()),
        ("trustedOrigins", settings.trusted_origins.join(",")),
        ("bridgePort", settings.bridge_port.to_string()),
    ]
}

fn apply_setting(settings: &mut Settings, key: &str, value: &str) -> Result<()> {
    match key {
        "perFileFolder" | "btDlFolder" => settings.per_file_folder = value.parse()?,
        "batchFolder" | "btDlAllFolder" => settings.batch_folder = value.parse()?,
        "ruleReleaseDelayMs" => settings.rule_release_delay_ms = value.parse()?,
        "nextDispatchDelayMs" => settings.next_dispatch_delay_ms = value.parse()?,
        "previewOpenDelayMs" => settings.preview_open_delay_ms = value.parse()?,
        "previewReleaseDelayMs" => settings.preview_release_delay_ms = value.parse()?,
        "trustedOrigins" => {
            settings.trusted_origins = value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect()
        }
        "bridgePort" => settings.bridge_port = value.parse()?,
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    }
    Ok(())
}
