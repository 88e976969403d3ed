//! CLI entry point for the ISP core simulator
//!
//! Builds a three-block chain of mock IPs on a tokio runtime with real watchdog
//! timers and drives it with simulated sensor vsyncs.
//!
//! # Usage
//!
//! Stream 60 frames, leaving every 5th frame to the scheduler:
//! ```bash
//! isp-sim run --frames 60 --skip-every 5
//! ```
//!
//! Stall the chain at frame 20 and let the watchdog recover it:
//! ```bash
//! isp-sim run --frames 40 --stall-at 20
//! ```
//!
//! Print the effective configuration:
//! ```bash
//! isp-sim config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use isp_core::config::{CoreConfig, DEFAULT_CONFIG_PATH};
use isp_core::hardware::{CallLog, MockFirmware, MockIp};
use isp_core::lifecycle::InstanceDesc;
use isp_core::timer::TokioTimer;
use isp_core::topology::ChainSpec;
use isp_core::{logging, spawn_completion_worker, FrameRequest, InstanceId, IspCore, Outcome, PipelineEvent};
use isp_core::{SlotDescriptor, SlotId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CHAIN: [(u8, &str); 3] = [(0, "csis"), (1, "byrp"), (2, "rgbp")];
const INSTANCE: InstanceId = InstanceId(0);

#[derive(Parser)]
#[command(name = "isp-sim")]
#[command(about = "Simulated ISP chain driven by the orchestration core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream simulated frames through a mock chain
    Run {
        /// Number of vsyncs to simulate
        #[arg(long, default_value = "30")]
        frames: u64,

        /// Time between config-lock and frame-end, in milliseconds
        #[arg(long, default_value = "33")]
        interval_ms: u64,

        /// Do not request every Nth frame (the core synthesises it)
        #[arg(long)]
        skip_every: Option<u64>,

        /// Stop delivering frame-end at this fcount and wait for the watchdog
        #[arg(long)]
        stall_at: Option<u64>,

        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            frames,
            interval_ms,
            skip_every,
            stall_at,
            config,
        } => {
            let config = load_config(config)?;
            logging::init_from_config(&config).context("failed to initialise logging")?;
            let options = SimOptions {
                frames,
                interval: Duration::from_millis(interval_ms),
                skip_every,
                stall_at,
            };
            run(config, options).await
        }
        Commands::Config { config } => {
            let config = load_config(config)?;
            println!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<CoreConfig> {
    let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    CoreConfig::load_from(&path).with_context(|| format!("failed to load configuration from {}", path.display()))
}

struct SimOptions {
    frames: u64,
    interval: Duration,
    skip_every: Option<u64>,
    stall_at: Option<u64>,
}

async fn run(config: CoreConfig, options: SimOptions) -> Result<()> {
    let watchdog = config.watchdog.timeout();
    let log = CallLog::new();
    let firmware = Arc::new(MockFirmware::new());

    let mut builder = IspCore::builder(config).firmware(firmware.clone());
    for (id, name) in CHAIN {
        let ops = Arc::new(MockIp::new(SlotId(id), name, log.clone()));
        ops.set_emit_meta(true);
        builder = builder.slot(SlotDescriptor::new(SlotId(id), ops, Arc::new(TokioTimer::new()?)));
    }
    let (core, receiver) = builder.build()?;

    let outcomes: Arc<Mutex<BTreeMap<&'static str, u64>>> = Arc::default();
    let restarts = Arc::new(Mutex::new(Vec::new()));
    let worker = {
        let outcomes = Arc::clone(&outcomes);
        let restarts = Arc::clone(&restarts);
        spawn_completion_worker(receiver, move |event| match event {
            PipelineEvent::Completed(done) => {
                *outcomes.lock().entry(done.outcome.label()).or_default() += 1;
            }
            PipelineEvent::ForceRestart { instance, reason } => {
                warn!(instance = %instance, reason = %reason, "force restart requested");
                restarts.lock().push(instance);
            }
        })
    };

    let chain = ChainSpec::linear(CHAIN.iter().map(|(id, _)| SlotId(*id)));
    core.open(InstanceDesc::new(INSTANCE, chain))?;
    core.start_stream(INSTANCE)?;
    info!(frames = options.frames, interval_ms = options.interval.as_millis() as u64, "simulation started");

    for fcount in 1..=options.frames {
        let skipped = options.skip_every.is_some_and(|n| n > 0 && fcount % n == 0);
        if !skipped {
            if let Err(e) = core.request_shot(INSTANCE, FrameRequest::new(fcount)) {
                warn!(fcount, error = %e, "request rejected");
            }
        }

        if let Err(e) = core.on_config_lock(SlotId(0), fcount) {
            warn!(fcount, error = %e, "config-lock handling failed");
        }
        if let Err(e) = core.on_firmware_response(INSTANCE, fcount, Ok(())) {
            warn!(fcount, error = %e, "firmware response failed");
        }
        for (id, _) in CHAIN {
            if let Err(e) = core.on_frame_start(SlotId(id), fcount) {
                warn!(fcount, slot = id, error = %e, "frame-start handling failed");
            }
        }

        tokio::time::sleep(options.interval).await;

        if options.stall_at == Some(fcount) {
            warn!(fcount, "simulated stall, waiting for the watchdog");
            tokio::time::sleep(watchdog * 2).await;
            break;
        }

        for (id, _) in CHAIN.iter().rev() {
            let slot = SlotId(*id);
            if let Err(e) = core.on_dma_done(slot) {
                warn!(fcount, slot = %slot, error = %e, "dma-done handling failed");
            }
            if let Err(e) = core.on_frame_end(slot, fcount, Outcome::Success) {
                warn!(fcount, slot = %slot, error = %e, "frame-end handling failed");
            }
        }
    }

    let flushed = core.stop_stream(INSTANCE)?;
    let stats = core.instance_stats(INSTANCE)?;
    core.close(INSTANCE)?;

    println!("Slot counters:");
    for (id, name) in CHAIN {
        let c = core.slot_counters(SlotId(id))?;
        println!(
            "  {:>2} {:<6} config_lock={:<5} frame_start={:<5} frame_end={:<5} dma_done={}",
            id, name, c.config_lock, c.frame_start, c.frame_end, c.dma_done
        );
    }
    println!("Instance {}:", INSTANCE);
    println!(
        "  requested={} internal={} completed={} failed={} late={} flushed_on_stop={}",
        stats.requested, stats.internal_frames, stats.completed, stats.failed, stats.late_frames, flushed
    );
    println!(
        "  firmware messages={} diagnostic dumps={}",
        firmware.messages().len(),
        core.registry().dumps()
    );

    drop(core);
    worker.await.context("completion worker panicked")?;

    println!("Completions:");
    for (label, count) in outcomes.lock().iter() {
        println!("  {:<22} {}", label, count);
    }
    let restarts = restarts.lock();
    if !restarts.is_empty() {
        println!("Force restarts requested: {}", restarts.len());
    }
    Ok(())
}
