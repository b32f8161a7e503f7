//! Conntrack Accounting Daemon
//!
//! Loads the conntrack accounting eBPF program, attaches its kprobes and
//! streams per-connection packet and byte counters to the selected sinks.
//!
//! ## Usage
//!
//! ```bash
//! # Print every update and destroy event as JSON lines
//! sudo ./conntrack-acct
//!
//! # Write destroy events to InfluxDB line protocol for 10 minutes
//! sudo ./conntrack-acct --sink influx --events destroy --output flows.lp --duration 600
//!
//! # Use program builds from a custom directory and a config file
//! sudo ./conntrack-acct --object-dir ./bpf/build --config acct.json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use conntrack_acct::{
    sysctl, Config, ConsumerMode, ConsumerStats, InfluxSink, JsonSink, Kallsyms, Pipeline,
    PipelineStats, ProbeStats, Sink, SinkType,
};
use log::{info, warn};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    signal,
    task::JoinHandle,
    time::{interval, sleep, Instant},
};

/// Conntrack flow accounting using eBPF
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Directory containing acct_<version>.o program builds
    #[clap(long)]
    object_dir: Option<PathBuf>,

    /// JSON configuration file, overridden by command line flags
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Pages per CPU for each perf buffer (power of two)
    #[clap(long)]
    perf_pages: Option<usize>,

    /// Output sink (stdout, json, influx), can be repeated
    #[clap(short, long = "sink", default_value = "stdout")]
    sinks: Vec<String>,

    /// Output file for the json and influx sinks
    #[clap(short, long, default_value = "conntrack-acct.out")]
    output: PathBuf,

    /// Events to export (update, destroy, all)
    #[clap(short, long, default_value = "all")]
    events: String,

    /// Duration to run (in seconds, 0 = infinite)
    #[clap(short, long, default_value_t = 0)]
    duration: u64,

    /// Statistics reporting interval in seconds (0 = disabled)
    #[clap(long, default_value_t = 10)]
    stats_interval: u64,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    let mode = parse_mode(&args.events)?;
    let sink_types = args
        .sinks
        .iter()
        .map(|s| s.parse::<SinkType>())
        .collect::<Result<Vec<_>>>()?;

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config file: {:?}", path))?,
        None => Config::default(),
    };
    if let Some(dir) = &args.object_dir {
        config.object_dir = dir.clone();
    }
    if args.perf_pages.is_some() {
        config.perf_pages = args.perf_pages;
    }

    info!("Starting conntrack accounting...");
    info!(
        "   Duration: {} seconds",
        if args.duration == 0 {
            "infinite".to_string()
        } else {
            args.duration.to_string()
        }
    );
    info!("   Object dir: {:?}", config.object_dir);
    info!("   Sinks: {}", args.sinks.join(", "));
    info!("   Events: {}", args.events);

    if sysctl::acct_enabled() == Some(false) {
        warn!(
            "net.netfilter.nf_conntrack_acct is disabled, packet and byte counters will be zero"
        );
    }

    // Symbols are only needed to validate the program build
    let kallsyms = Kallsyms::load().context("Failed to read kernel symbols")?;
    let pipeline = Arc::new(Pipeline::init(&config, &kallsyms)?);
    drop(kallsyms);

    for sink in build_sinks(&sink_types, &args.output, mode)? {
        pipeline.register_sink(sink)?;
    }

    pipeline.start()?;

    if let Some(mut errors) = pipeline.probe().take_errors() {
        tokio::spawn(async move {
            while let Some(e) = errors.recv().await {
                warn!("Probe error: {}", e);
            }
        });
    }

    let reporter = spawn_stats_reporter(Arc::clone(&pipeline), args.stats_interval);

    info!("Collecting accounting events...");

    // Run for specified duration or until interrupted
    let start_time = Instant::now();
    if args.duration > 0 {
        tokio::select! {
            _ = sleep(Duration::from_secs(args.duration)) => {
                info!("Duration reached, shutting down...");
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down...");
            }
        }
    } else {
        signal::ctrl_c().await?;
        info!("Interrupted, shutting down...");
    }

    if let Some(reporter) = reporter {
        reporter.abort();
    }

    pipeline.stop()?;
    let consumers = pipeline.drain().await;

    print_summary(
        start_time.elapsed().as_secs(),
        &pipeline.probe_stats(),
        &pipeline.stats(),
        &consumers,
    );

    Ok(())
}

fn parse_mode(events: &str) -> Result<ConsumerMode> {
    match events.to_lowercase().as_str() {
        "update" => Ok(ConsumerMode::Update),
        "destroy" => Ok(ConsumerMode::Destroy),
        "all" => Ok(ConsumerMode::All),
        _ => anyhow::bail!(
            "Unsupported event selection: {}. Use update, destroy, or all",
            events
        ),
    }
}

fn build_sinks(
    types: &[SinkType],
    output: &Path,
    mode: ConsumerMode,
) -> Result<Vec<Arc<dyn Sink>>> {
    let file_sinks = types.iter().filter(|t| **t != SinkType::Stdout).count();
    if file_sinks > 1 {
        anyhow::bail!("Only one of the json and influx sinks can write to --output");
    }

    let mut sinks: Vec<Arc<dyn Sink>> = Vec::with_capacity(types.len());
    for t in types {
        let sink: Arc<dyn Sink> = match t {
            SinkType::Stdout => Arc::new(JsonSink::stdout(mode)),
            SinkType::Json => Arc::new(JsonSink::create(output, mode)?),
            SinkType::Influx => Arc::new(InfluxSink::create(
                output,
                "conntrack_acct".to_string(),
                mode,
            )?),
        };
        sinks.push(sink);
    }

    Ok(sinks)
}

/// Periodically log probe statistics
fn spawn_stats_reporter(pipeline: Arc<Pipeline>, interval_secs: u64) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs));
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let probe = pipeline.probe_stats();
            let stats = pipeline.stats();
            info!(
                "📈 Progress: {} events ({} update, {} destroy), {} lost in kernel, {} pushed to sinks",
                probe.events_total,
                probe.events_update,
                probe.events_destroy,
                probe.events_lost,
                stats.events_pushed
            );
        }
    }))
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║        Conntrack Accounting - eBPF Probe          ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_summary(
    elapsed: u64,
    probe: &ProbeStats,
    pipeline: &PipelineStats,
    consumers: &[(String, ConsumerStats)],
) {
    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Duration:           {} seconds", elapsed);
    info!("  Total events:       {}", probe.events_total);
    info!("    update:           {:>8}", probe.events_update);
    info!("    destroy:          {:>8}", probe.events_destroy);
    info!("  Lost in kernel:     {}", probe.events_lost);
    info!("  Decode errors:      {}", probe.decode_errors);
    info!("  Reader failures:    {}", probe.read_errors);
    info!("");
    info!("  Sinks:              {}", pipeline.sinks);
    info!("  Pushed to sinks:    {}", pipeline.events_pushed);
    info!("  Push errors:        {}", pipeline.push_errors);
    if !consumers.is_empty() {
        info!("");
        info!("  Sink Queues:");
        for (name, stats) in consumers {
            info!(
                "    {}: {} received, {} lost",
                name, stats.events_received, stats.events_lost
            );
        }
    }
    info!("");
    info!("============================================");
}
