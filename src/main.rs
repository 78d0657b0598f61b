use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use flowcap::config::CollectorConfig;
use flowcap::fields::FieldCatalog;
use flowcap::server::FlowCollector;
use flowcap::sinks::{ConsoleSink, Target};

#[derive(Parser, Debug)]
#[command(name = "flowcap", version, about = "NetFlow v5/v9 and IPFIX collector")]
struct Opts {
    /// Read configuration from the specified file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Validate the configuration and field definitions, then exit
    #[arg(long)]
    dry_run: bool,

    /// Enable more detailed internal logging. Repeat to increase level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Reduce detail of internal logging. Repeat to reduce further.
    /// Overrides `--verbose`.
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,
}

fn init_logging(opts: &Opts) {
    let level = if opts.quiet >= 2 {
        "error"
    } else if opts.quiet == 1 {
        "warn"
    } else {
        match opts.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_from_env("FLOWCAP_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("flowcap={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(opts: Opts) -> Result<(), Box<dyn std::error::Error>> {
    let config = CollectorConfig::load(&opts.config)?;
    let catalog = FieldCatalog::load(
        config.netflow_definitions.as_deref(),
        config.ipfix_definitions.as_deref(),
    )?;

    if opts.dry_run {
        info!(message = "Configuration and field definitions are valid.");
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!(message = "Stop signal received, shutting down.");
        flag.store(true, Ordering::Relaxed);
    })?;

    let sink = Arc::new(ConsoleSink::new(Target::Stdout));
    FlowCollector::new(config, catalog, sink, shutdown).run()?;
    Ok(())
}

fn main() -> ExitCode {
    let opts = Opts::parse();
    init_logging(&opts);

    match run(opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(message = "Collector failed.", %error);
            ExitCode::FAILURE
        }
    }
}
