//! Linkdrop CLI
//!
//! Runs the extension bridge that backs the Linkdrop browser extension, and
//! simulates batches against an in-process host.

mod bridge;
mod commands;
mod output;
mod progress;
mod remote_host;
mod simulate;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Linkdrop - download backend for the browser extension
#[derive(Parser)]
#[command(name = "linkdrop")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for Linkdrop
    #[arg(long, env = "LINKDROP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the extension bridge
    Serve {
        /// Port to listen on (defaults to the configured bridge port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a batch against a simulated browser
    Simulate {
        /// Batch JSON file; a generated batch is used when omitted
        file: Option<PathBuf>,

        /// Number of links in the generated batch
        #[arg(short = 'n', long, default_value_t = 25)]
        links: usize,

        /// Attach download headers so the batch goes through DOM clicks
        #[arg(long)]
        dom: bool,

        /// Simulated download time in milliseconds
        #[arg(long, default_value_t = 300)]
        latency_ms: u64,

        /// Fail every n-th download
        #[arg(long)]
        fail_every: Option<u64>,

        /// Simulate a browser without an open trusted tab
        #[arg(long)]
        no_context: bool,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        "info,linkdrop=debug,linkdrop_core=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Logs go to stderr so JSON output stays parseable
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("linkdrop"))
            .unwrap_or_else(|| PathBuf::from(".linkdrop"))
    });

    // Execute command
    match cli.command {
        Commands::Serve { port } => commands::serve(data_dir, port).await?,

        Commands::Simulate {
            file,
            links,
            dom,
            latency_ms,
            fail_every,
            no_context,
        } => {
            let options = commands::SimulateOptions {
                file,
                links,
                dom,
                latency_ms,
                fail_every,
                no_context,
            };
            commands::simulate(data_dir, options, cli.output).await?
        }

        Commands::Config { action } => commands::config_action(data_dir, action, cli.output).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "linkdrop", &mut std::io::stdout());
        }
    }

    Ok(())
}
