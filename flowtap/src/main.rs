use std::{
    fs::File,
    io::{self, BufWriter, Write},
    net::Ipv4Addr,
    path::{Path, PathBuf},
    process::exit,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tokio::{signal, time::Instant};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use flowtap::{
    CaptureConfig, CaptureError, CapturedFrame, FlowCapture, FlowTableMode, Polled, XdpMode,
    model::FlowDump,
};

const LOG_ENV: &str = "FLOWTAP_LOG";
const IDLE_POLL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "flowtap")]
#[command(about = "Zero-copy packet capture with per-flow accounting", long_about = None)]
struct Cli {
    /// YAML configuration file; FLOWTAP_* variables and flags override it
    #[arg(long, global = true, value_name = "PATH", env = "FLOWTAP_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the flow key of every captured frame
    Capture(CaptureCommand),
    /// Capture for a while, then dump the flow table as JSON
    Flows(FlowsCommand),
    /// Measure delivered throughput and kernel drops
    Bench(BenchCommand),
}

#[derive(Args)]
struct RingArgs {
    /// Network interface to capture on
    #[arg(long, short, value_name = "IFACE")]
    interface: Option<String>,
    /// Size of each ring block (bytes, power of two)
    #[arg(long, value_name = "BYTES")]
    block_size: Option<u32>,
    /// Frame slot size within a block (bytes)
    #[arg(long, value_name = "BYTES")]
    frame_size: Option<u32>,
    /// Total ring size (bytes)
    #[arg(long, value_name = "BYTES")]
    ring_size: Option<u32>,
    /// Milliseconds before a partially filled block is retired
    #[arg(long, value_name = "MILLIS")]
    retire_timeout_ms: Option<u32>,
    /// Put the interface into promiscuous mode
    #[arg(long)]
    promiscuous: bool,
    /// Where flows are accounted
    #[arg(long, value_enum, value_name = "MODE")]
    flow_table: Option<FlowTableMode>,
    /// Maximum number of tracked flows
    #[arg(long, value_name = "ENTRIES")]
    flow_capacity: Option<u32>,
    /// XDP attach mode for the kernel flow table
    #[arg(long, value_enum, value_name = "MODE")]
    xdp_mode: Option<XdpMode>,
}

impl RingArgs {
    fn apply(self, config: &mut CaptureConfig) {
        if let Some(interface) = self.interface {
            config.interface = interface;
        }
        if let Some(v) = self.block_size {
            config.ring.block_size = v;
        }
        if let Some(v) = self.frame_size {
            config.ring.frame_size = v;
        }
        if let Some(v) = self.ring_size {
            config.ring.ring_size = v;
        }
        if let Some(v) = self.retire_timeout_ms {
            config.ring.retire_timeout_ms = v;
        }
        config.promiscuous |= self.promiscuous;
        if let Some(mode) = self.flow_table {
            config.flow_table.mode = mode;
        }
        if let Some(v) = self.flow_capacity {
            config.flow_table.capacity = v;
        }
        if let Some(mode) = self.xdp_mode {
            config.flow_table.xdp_mode = mode;
        }
    }
}

#[derive(Args)]
struct CaptureCommand {
    #[command(flatten)]
    ring: RingArgs,
    /// Stop after this many frames
    #[arg(long, short = 'c')]
    count: Option<u64>,
    /// Stop after this many seconds
    #[arg(long, value_name = "SECS")]
    duration_secs: Option<u64>,
}

#[derive(Args)]
struct FlowsCommand {
    #[command(flatten)]
    ring: RingArgs,
    /// Seconds to capture before dumping
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    duration_secs: u64,
    /// Write the JSON dump here instead of stdout
    #[arg(long, short, value_name = "PATH")]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct BenchCommand {
    #[command(flatten)]
    ring: RingArgs,
    /// Seconds to measure
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    duration_secs: u64,
    /// Write the JSON report here instead of stdout
    #[arg(long, short, value_name = "PATH")]
    output: Option<PathBuf>,
}

#[derive(Serialize)]
struct BenchReport {
    interface: String,
    started_at: String,
    elapsed_secs: f64,
    frames: u64,
    bytes: u64,
    pps: f64,
    gbps: f64,
    skipped: u64,
    blocks_released: u64,
    kernel_packets: u64,
    kernel_drops: u64,
    kernel_freezes: u64,
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("flowtap error: {err:?}");
        exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_ansi(std::env::var("NO_COLOR").is_err());
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let Some(command) = cli.command else {
        Cli::command().print_help().ok();
        println!();
        return Ok(());
    };

    let mut config = CaptureConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    match command {
        Commands::Capture(cmd) => {
            cmd.ring.apply(&mut config);
            run_capture(&config, cmd.count, cmd.duration_secs.map(Duration::from_secs)).await
        }
        Commands::Flows(cmd) => {
            cmd.ring.apply(&mut config);
            run_flows(&config, Duration::from_secs(cmd.duration_secs), cmd.output.as_deref()).await
        }
        Commands::Bench(cmd) => {
            cmd.ring.apply(&mut config);
            run_bench(&config, Duration::from_secs(cmd.duration_secs), cmd.output.as_deref()).await
        }
    }
}

fn start(config: &CaptureConfig) -> Result<FlowCapture> {
    anyhow::ensure!(!config.interface.is_empty(), "no interface given (use --interface or FLOWTAP_INTERFACE)");
    let capture = FlowCapture::start(config)
        .with_context(|| format!("failed to start capture on {}", config.interface))?;

    let stop = capture.stop_handle();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("received shutdown signal, stopping capture");
                stop.stop();
            }
            Err(err) => warn!(error = %err, "failed to wait for ctrl-c"),
        }
    });
    Ok(capture)
}

/// Poll until `deadline`, `limit` frames, or ctrl-c, handing each frame to
/// `on_frame`.
async fn drive<F>(
    capture: &mut FlowCapture,
    deadline: Option<Instant>,
    limit: Option<u64>,
    mut on_frame: F,
) -> Result<u64>
where
    F: FnMut(&CapturedFrame<'_>),
{
    let mut seen = 0u64;
    while limit.map_or(true, |limit| seen < limit) {
        let timeout = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                left.min(IDLE_POLL)
            }
            None => IDLE_POLL,
        };
        match capture.poll(Some(timeout)).await {
            Ok(Polled::Frame(frame)) => {
                seen += 1;
                on_frame(&frame);
            }
            Ok(Polled::Empty) => {}
            Err(CaptureError::Closed) => break,
            Err(err) => return Err(err).context("capture failed"),
        }
    }
    Ok(seen)
}

async fn run_capture(config: &CaptureConfig, count: Option<u64>, duration: Option<Duration>) -> Result<()> {
    let mut capture = start(config)?;
    let deadline = duration.map(|d| Instant::now() + d);

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut write_err = None;
    drive(&mut capture, deadline, count, |frame| {
        if write_err.is_none() {
            if let Err(err) = writeln!(out, "{}", describe(frame)) {
                write_err = Some(err);
            }
        }
    })
    .await?;
    out.flush().context("failed to write to stdout")?;
    if let Some(err) = write_err {
        return Err(err).context("failed to write to stdout");
    }

    let stats = capture.stop();
    info!(
        frames = stats.frames_delivered,
        skipped = stats.skipped(),
        kernel_drops = stats.kernel.drops,
        "capture finished"
    );
    Ok(())
}

async fn run_flows(config: &CaptureConfig, duration: Duration, output: Option<&Path>) -> Result<()> {
    let mut capture = start(config)?;
    let table = capture
        .flow_table()
        .context("flow tracking is off; pick --flow-table kernel, software or auto")?;

    let deadline = Instant::now() + duration;
    drive(&mut capture, Some(deadline), None, |_| {}).await?;
    let stats = capture.stop();

    let flows = table.snapshot().context("failed to read flow table")?;
    let counters = table.counters().context("failed to read flow table counters")?;
    if counters.rejected_full > 0 {
        warn!(
            rejected = counters.rejected_full,
            capacity = table.capacity(),
            "flow table was full; new flows were not tracked"
        );
    }
    info!(flows = flows.len(), frames = stats.frames_delivered, "dumping flow table");

    let dump = FlowDump::new(&config.interface, Utc::now(), table.source(), counters, flows);
    write_json(&dump, output)
}

async fn run_bench(config: &CaptureConfig, duration: Duration, output: Option<&Path>) -> Result<()> {
    let mut capture = start(config)?;
    let started_at = Utc::now();
    let started = Instant::now();
    drive(&mut capture, Some(started + duration), None, |_| {}).await?;
    let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
    let stats = capture.stop();

    let report = BenchReport {
        interface: config.interface.clone(),
        started_at: started_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        elapsed_secs: elapsed,
        frames: stats.frames_delivered,
        bytes: stats.bytes_delivered,
        pps: stats.frames_delivered as f64 / elapsed,
        gbps: stats.bytes_delivered as f64 * 8.0 / elapsed / 1e9,
        skipped: stats.skipped(),
        blocks_released: stats.blocks_released,
        kernel_packets: stats.kernel.packets,
        kernel_drops: stats.kernel.drops,
        kernel_freezes: stats.kernel.freezes,
    };
    write_json(&report, output)
}

fn write_json<T: Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, value).context("failed to encode JSON")?;
            writer.flush().with_context(|| format!("failed to write {}", path.display()))
        }
        None => {
            let mut stdout = io::stdout().lock();
            serde_json::to_writer_pretty(&mut stdout, value).context("failed to encode JSON")?;
            writeln!(stdout).context("failed to write to stdout")
        }
    }
}

fn describe(frame: &CapturedFrame<'_>) -> String {
    let key = &frame.key;
    let secs = (frame.timestamp_ns / 1_000_000_000) as i64;
    let nanos = (frame.timestamp_ns % 1_000_000_000) as u32;
    let at = DateTime::<Utc>::from_timestamp(secs, nanos)
        .map(|t| t.format("%H:%M:%S%.6f").to_string())
        .unwrap_or_default();
    format!(
        "{at} {}:{} -> {}:{} proto:{} len:{}",
        Ipv4Addr::from(key.src_addr),
        key.src_port,
        Ipv4Addr::from(key.dst_addr),
        key.dst_port,
        key.protocol,
        frame.wire_len
    )
}
