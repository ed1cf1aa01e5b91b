use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use axum::{routing::get, Router};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use fareflow_core::config::parse_duration_ms;
use fareflow_core::{BatchOperator, BatchSink, Executor, LineSource, PipelineConfig, RideEvent, RunSummary};
use fareflow_io::{ConsoleSink, CsvAppendSink, CsvBatchSink, LineReader};
use fareflow_ops::{DriverAggregator, ParsedEvents, WindowFareAggregator};
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fareflow", version, about = "Ride event streaming pipelines", disable_help_subcommand = false)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Pipeline TOML; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 0)]
    http_port: u16,
    /// Print each batch to stdout instead of writing CSV files
    #[arg(long)]
    console: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Persist every parsed ride event
    Ingest(RunArgs),
    /// Total fare and average distance per driver
    Drivers(RunArgs),
    /// Total fare per sliding event-time window
    Windows(RunArgs),
    /// Run a task against a JSONL capture instead of the socket
    Replay {
        #[arg(value_enum)]
        task: Task,
        file: PathBuf,
        #[command(flatten)]
        args: RunArgs,
    },
    /// Serve random ride events to every client that connects
    Generate {
        #[arg(long, default_value_t = 9999)]
        port: u16,
        #[arg(long, default_value = "1s")]
        interval: String,
        #[arg(long, default_value_t = 10)]
        drivers: i64,
    },
    /// Serve only /metrics
    Serve {
        #[arg(long, default_value_t = 9898)]
        port: u16,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Ingest,
    Drivers,
    Windows,
}

fn app() -> Router {
    Router::new().route("/metrics", get(metrics))
}

async fn metrics() -> String {
    fareflow_core::metrics::render_prometheus()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Ingest(args) => run_task(Task::Ingest, None, args).await,
        Commands::Drivers(args) => run_task(Task::Drivers, None, args).await,
        Commands::Windows(args) => run_task(Task::Windows, None, args).await,
        Commands::Replay { task, file, args } => run_task(task, Some(file), args).await,
        Commands::Generate { port, interval, drivers } => {
            let every = Duration::from_millis(parse_duration_ms(&interval)?.max(1) as u64);
            anyhow::ensure!(drivers > 0, "--drivers must be positive");
            generate(port, every, drivers).await
        }
        Commands::Serve { port } => {
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            info!("serving /metrics on {}", addr);
            let listener = TcpListener::bind(addr).await?;
            axum::serve(listener, app()).await?;
            Ok(())
        }
    }
}

async fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let cfg = match path {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => PipelineConfig::default(),
    };
    cfg.validate()?;
    Ok(cfg)
}

async fn run_task(task: Task, replay: Option<PathBuf>, args: RunArgs) -> anyhow::Result<()> {
    let cfg = load_config(args.config.as_deref()).await?;
    if args.http_port != 0 {
        let addr = SocketAddr::from(([127, 0, 0, 1], args.http_port));
        let listener = TcpListener::bind(addr).await?;
        info!("serving /metrics on {}", addr);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app()).await;
        });
    }
    let summary = match replay {
        Some(file) => dispatch(task, &cfg, LineReader::open(&file).await?, args.console).await?,
        None => {
            info!(addr = %cfg.address(), ?task, "connecting to event source");
            let reader = LineReader::connect(&cfg.host, cfg.port).await?;
            dispatch(task, &cfg, reader, args.console).await?
        }
    };
    info!(?task, ?summary, "task finished");
    Ok(())
}

async fn dispatch<S>(task: Task, cfg: &PipelineConfig, source: S, console: bool) -> anyhow::Result<RunSummary>
where
    S: LineSource + 'static,
{
    match task {
        Task::Ingest => {
            if console {
                execute(cfg, source, ParsedEvents, ConsoleSink).await
            } else {
                let sink = CsvAppendSink::new(cfg.output_root.join("events.csv"));
                execute(cfg, source, ParsedEvents, sink).await
            }
        }
        Task::Drivers => {
            let op = DriverAggregator::new(cfg.driver_mode);
            if console {
                execute(cfg, source, op, ConsoleSink).await
            } else {
                execute(cfg, source, op, CsvBatchSink::new(cfg.output_root.join("drivers"))).await
            }
        }
        Task::Windows => {
            let op = WindowFareAggregator::from_config(cfg)?;
            if console {
                execute(cfg, source, op, ConsoleSink).await
            } else {
                execute(cfg, source, op, CsvBatchSink::new(cfg.output_root.join("windows"))).await
            }
        }
    }
}

async fn execute<S, O, K>(cfg: &PipelineConfig, source: S, op: O, sink: K) -> anyhow::Result<RunSummary>
where
    S: LineSource + 'static,
    O: BatchOperator + 'static,
    K: BatchSink<O::Row> + 'static,
{
    let mut exec = Executor::<O::Row>::new(cfg.trigger_interval()?);
    exec.source(source)
        .operator(op)
        .sink(sink)
        .max_batch_size(cfg.max_batch_size)
        .shutdown_on(async {
            if tokio::signal::ctrl_c().await.is_err() {
                // no signal handler available: run until the source closes
                std::future::pending::<()>().await;
            }
            info!("interrupted, flushing pending batch");
        });
    Ok(exec.run().await?)
}

async fn generate(port: u16, every: Duration, drivers: i64) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, ?every, "event generator listening");
    loop {
        let (sock, peer) = listener.accept().await?;
        info!(%peer, "client connected");
        tokio::spawn(async move {
            if let Err(e) = feed(sock, every, drivers).await {
                warn!(%peer, error = %e, "client dropped");
            }
        });
    }
}

async fn feed(mut sock: TcpStream, every: Duration, drivers: i64) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(every);
    let mut seq = 0u64;
    loop {
        ticker.tick().await;
        let mut line = random_ride(seq, drivers).to_json_line()?;
        line.push('\n');
        sock.write_all(line.as_bytes()).await?;
        seq += 1;
    }
}

fn random_ride(seq: u64, drivers: i64) -> RideEvent {
    let mut rng = rand::thread_rng();
    let distance_km = (rng.gen_range(0.5..40.0_f64) * 10.0).round() / 10.0;
    let fare_amount = ((2.5 + distance_km * rng.gen_range(1.2..2.5)) * 100.0).round() / 100.0;
    // a few events arrive up to 90s late so the watermark has something to reject
    let lag = if rng.gen_bool(0.05) { rng.gen_range(0..90) } else { 0 };
    RideEvent {
        trip_id: format!("trip-{seq}"),
        driver_id: rng.gen_range(1..=drivers),
        distance_km,
        fare_amount,
        event_time: Utc::now() - chrono::Duration::seconds(lag),
    }
}
