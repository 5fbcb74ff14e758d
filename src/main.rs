//! # Fabric Controller Entry Point
//!
//! Loads configuration, starts the telemetry recorder, the statistics
//! poller and the OpenFlow listener, and runs until Ctrl-C.

use clap::Parser;
use fabric::config::ControllerConfig;
use fabric::controller::Controller;
use fabric::poller::TelemetryPoller;
use fabric::registry::DatapathRegistry;
use fabric::telemetry::{RecordKind, TelemetryRecorder, TelemetrySink};
use fabric::transport::OpenFlowServer;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "fabric-controller")]
#[command(about = "OpenFlow 1.3 learning controller with telemetry polling", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to accept switch connections on
    #[arg(long)]
    listen: Option<String>,

    /// Directory for telemetry streams
    #[arg(long)]
    telemetry_dir: Option<String>,

    /// Mirror telemetry into this SQLite database
    #[arg(long)]
    sqlite_path: Option<String>,

    /// Statistics poll interval
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Idle timeout for learned rules (seconds, 0 = permanent)
    #[arg(long)]
    idle_timeout: Option<u16>,

    /// Hard timeout for learned rules (seconds, 0 = permanent)
    #[arg(long)]
    hard_timeout: Option<u16>,

    /// Disable statistics polling
    #[arg(long)]
    no_poller: bool,

    /// Disable telemetry persistence
    #[arg(long)]
    no_telemetry: bool,
}

impl Args {
    fn apply(&self, config: &mut ControllerConfig) {
        if let Some(ref listen) = self.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(ref dir) = self.telemetry_dir {
            config.telemetry.output_dir = dir.clone();
        }
        if let Some(ref path) = self.sqlite_path {
            config.telemetry.sqlite_path = Some(path.clone());
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poller.poll_interval_ms = ms;
        }
        if let Some(secs) = self.idle_timeout {
            config.flow.idle_timeout = secs;
        }
        if let Some(secs) = self.hard_timeout {
            config.flow.hard_timeout = secs;
        }
        if self.no_poller {
            config.poller.enabled = false;
        }
        if self.no_telemetry {
            config.telemetry.enabled = false;
        }
    }
}

fn load_config(args: &Args) -> Result<ControllerConfig, String> {
    let mut config = ControllerConfig::load(args.config.as_deref())?;
    config.apply_env()?;
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    println!("=================================================");
    println!("  Fabric Controller - Learning & Telemetry       ");
    println!("=================================================");
    println!();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    let recorder = match TelemetryRecorder::new(config.telemetry.clone()) {
        Ok(recorder) => Arc::new(recorder),
        Err(e) => {
            eprintln!("✗ Failed to initialize telemetry: {}", e);
            return Err(e.into());
        }
    };
    println!("✓ Telemetry initialized");
    if recorder.is_enabled() {
        println!("  - Output directory: {}", config.telemetry.output_dir);
        println!(
            "  - Packet-in sample rate: {}",
            config.telemetry.packet_in_sample_rate
        );
        if let Some(ref path) = config.telemetry.sqlite_path {
            println!("  - SQLite mirror: {}", path);
        }
    } else {
        println!("  - Disabled");
    }
    println!();

    let registry = Arc::new(DatapathRegistry::new());
    let sink: Arc<dyn TelemetrySink> = recorder.clone();
    let controller = Arc::new(Controller::new(registry.clone(), sink, config.flow));
    println!("✓ Flow manager ready");
    println!(
        "  - Rule timeouts: idle {}s, hard {}s (0 = permanent)",
        config.flow.idle_timeout, config.flow.hard_timeout
    );
    println!();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = Arc::new(TelemetryPoller::new(registry.clone(), config.poller.clone()));
    let poller_task = tokio::spawn(poller.clone().start(shutdown_rx.clone()));
    let flush_task = tokio::spawn(recorder.clone().run_flush_loop(shutdown_rx.clone()));
    println!("✓ Telemetry poller");
    if config.poller.enabled {
        println!("  - Interval: {}ms", config.poller.poll_interval_ms);
    } else {
        println!("  - Disabled");
    }
    println!();

    let server = Arc::new(OpenFlowServer::new(config.transport(), controller));
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("✗ {}", e);
            return Err(e.into());
        }
    };
    println!("Listening for switches on {}", config.listen_addr);
    println!();

    let server_task = tokio::spawn(server.serve(listener, shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutdown requested");
    shutdown_tx.send(true).ok();

    for (name, task) in [
        ("listener", server_task),
        ("poller", poller_task),
        ("telemetry flush", flush_task),
    ] {
        if let Err(e) = task.await {
            error!("{} task ended abnormally: {}", name, e);
        }
    }

    let stats = recorder.stats();
    info!(
        "Telemetry: {} records written, {} packet-in summaries sampled out, {} write failures, {} dropped on a full queue",
        stats.total_accepted(),
        stats.sampled_out,
        stats.write_failures,
        stats.queue_dropped
    );
    for kind in RecordKind::ALL {
        info!("  {}: {}", kind, stats.accepted_of(kind));
    }

    println!("=================================================");
    println!("  Fabric Controller Shut Down");
    println!("=================================================");

    Ok(())
}
