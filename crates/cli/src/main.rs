mod commands;
mod render;
mod settings;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use runway_engine::Resolution;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Inspect and repair a Runway audit ledger.
#[derive(Parser)]
#[command(name = "runway", version, about = "Runway change audit operations")]
struct Cli {
    /// Path to the JSON-lines audit ledger
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every audit entry in insertion order
    History {
        /// Only entries of this change
        #[arg(long)]
        change: Option<String>,
    },

    /// Print the latest entry of each change
    Snapshot {
        /// Only changes whose latest entry is at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<String>,
    },

    /// List changes that need operator attention
    Issues,

    /// Show one open issue with the change's full history
    Issue {
        /// Change id
        change_id: String,
    },

    /// Close an open issue by recording how it was resolved
    Fix {
        /// Change id
        change_id: String,
        /// applied or rolled-back
        #[arg(long, value_parser = parse_resolution)]
        resolution: Resolution,
    },
}

fn parse_resolution(s: &str) -> Result<Resolution, String> {
    s.parse()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let settings = match settings::Settings::resolve(cli.config.as_deref(), cli.ledger) {
        Ok(s) => s,
        Err(msg) => {
            report_error(&msg, cli.output, cli.quiet);
            process::exit(2);
        }
    };
    let ops = settings.ops_client();
    let out = commands::Out {
        format: cli.output,
        quiet: cli.quiet,
    };

    let result = match cli.command {
        Commands::History { change } => commands::history(&ops, change.as_deref(), out).await,
        Commands::Snapshot { since } => commands::snapshot(&ops, since.as_deref(), out).await,
        Commands::Issues => commands::issues(&ops, out).await,
        Commands::Issue { change_id } => commands::issue(&ops, &change_id, out).await,
        Commands::Fix {
            change_id,
            resolution,
        } => commands::fix(&ops, &change_id, resolution, out).await,
    };

    if let Err(msg) = result {
        report_error(&msg, cli.output, cli.quiet);
        process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("error: {}", msg),
        OutputFormat::Json => eprintln!("{}", serde_json::json!({ "error": msg })),
    }
}
