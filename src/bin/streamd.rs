//! streamd - multi-stream capture daemon
//!
//! This daemon:
//! 1. Loads the source list (config file, STREAMD_* env, CLI flags)
//! 2. Connects every source in parallel within the retry budget
//! 3. Polls the latest frame of each source and logs FPS/latency
//! 4. Reconnects or drops sources that fail while running
//! 5. Shuts down on Ctrl-C or after --duration-secs and prints a final report

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stream_supervisor::ui::{Ui, UiMode};
use stream_supervisor::{DefaultDecoderFactory, LogSink, StreamSupervisor, StreamdConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Supervise live video streams and report per-stream FPS")]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "STREAMD_CONFIG")]
    config: Option<PathBuf>,

    /// Stop after this many seconds (0 = until Ctrl-C).
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Sleep between poll iterations in milliseconds (0 = yield only).
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Progress output style.
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::detect(args.ui);

    let mut cfg = match StreamdConfig::load_from(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            log::error!("{:#}", err);
            std::process::exit(2);
        }
    };
    if let Some(secs) = args.duration_secs {
        cfg.duration = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(ms) = args.poll_interval_ms {
        cfg.poll_interval = Duration::from_millis(ms);
    }
    log::info!(
        "streamd starting with {} sources (max_attempts={}, retry_interval={:?})",
        cfg.sources.len(),
        cfg.retry.max_attempts,
        cfg.retry.retry_interval
    );

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("install Ctrl-C handler")?;
    }

    let factory = Arc::new(DefaultDecoderFactory::new());
    let mut supervisor = {
        let mut stage = ui.stage("Connecting streams");
        let supervisor = StreamSupervisor::start_all_with_stop(
            cfg.sources.clone(),
            factory,
            cfg.supervisor_config(),
            stop,
        )?;
        stage.set_detail(format!(
            "{}/{} connected",
            supervisor.active_ids().len(),
            cfg.sources.len()
        ));
        supervisor
    };

    let mut sink = LogSink::new(cfg.report_interval);
    let reason = supervisor.run_loop(&mut sink, &cfg.run_options());
    log::info!("streamd stopping: {:?}", reason);

    let report = {
        let _stage = ui.stage("Shutting down");
        supervisor.shutdown()
    };
    ui.report(&report);
    Ok(())
}
