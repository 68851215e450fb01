//! Bootstrap binary implementing the `enable_2`-equivalent external
//! contract (spec §6) as a CLI: parses provider strings, enables one
//! session against the process-wide facade, and runs until a shutdown
//! signal, the way `cognitod::main` drives the daemon it bootstraps.

mod config;
mod providers;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eventpipe::{EnableArgs, FileSink};
use eventpipe_wire::{SerializationFormat, SessionType};

use config::Config;
use providers::parse_provider_config_string;

#[derive(Parser, Debug)]
#[command(name = "eventpipe-cli")]
#[command(about = "Enables an EventPipe trace session from the command line")]
struct Args {
    /// Path to the config file; overrides $EVENTPIPE_CONFIG and the
    /// built-in default.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Where to write the NetTrace stream.
    #[arg(long, value_name = "PATH", default_value = "trace.nettrace")]
    output: PathBuf,

    /// `name:keywords_hex:level:filter[,…]`, or `*` for every provider.
    /// Appended to whatever `[session].providers` the config file lists.
    #[arg(long, value_name = "SPEC")]
    providers: Vec<String>,

    /// Circular buffer budget in MiB; overrides the config file.
    #[arg(long, value_name = "MB")]
    circular_mb: Option<usize>,

    /// Rundown keyword; overrides the config file.
    #[arg(long, value_name = "KEYWORD")]
    rundown_keyword: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load(args.config.as_deref());

    let mut provider_specs = config.session.providers.clone();
    provider_specs.extend(args.providers.clone());
    if provider_specs.is_empty() {
        provider_specs.push("*".to_string());
    }

    let mut providers = Vec::new();
    for spec in &provider_specs {
        providers.extend(parse_provider_config_string(spec)?);
    }

    let circular_buffer_mb = args.circular_mb.unwrap_or(config.session.circular_buffer_mb);
    let rundown_keyword = args.rundown_keyword.unwrap_or(config.session.rundown_keyword);

    let pipe = eventpipe::global();
    pipe.init();
    pipe.finish_init();

    let sink = Arc::new(FileSink::create(&args.output)?);
    let id = pipe
        .enable(EnableArgs {
            session_type: SessionType::FileStream,
            format: SerializationFormat::NetTraceV4,
            circular_buffer_mb,
            rundown_keyword,
            providers,
            sink: Some(sink),
            sync_callback: None,
        })
        .ok_or_else(|| anyhow::anyhow!("no free session slot (max 64)"))?;

    log::info!("session {id} enabled, writing to {}", args.output.display());

    wait_for_shutdown().await;

    log::info!("shutting down, draining session {id}");
    pipe.disable(id);
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
