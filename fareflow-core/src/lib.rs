//! fareflow-core: ride events, micro-batching and a small batch executor.
//!
//! The pieces of a pipeline:
//! - a [`LineSource`] yielding raw text lines (TCP socket, file replay, ...)
//! - [`parse_event`] turning each line into a [`RideEvent`] (bad lines are dropped and counted)
//! - a [`BatchAccumulator`] closing [`MicroBatch`]es on a wall-clock trigger
//! - a [`BatchOperator`] folding each batch into result rows
//! - a [`BatchSink`] persisting each batch's rows under its batch index
//!
//! Quick example:
//! ```no_run
//! use fareflow_core::{BatchOperator, BatchSink, Executor, LineSource, MicroBatch, RideEvent};
//! # #[tokio::main]
//! # async fn main() -> fareflow_core::Result<()> {
//! struct OneLine(Option<String>);
//! #[async_trait::async_trait]
//! impl LineSource for OneLine {
//!     async fn next_line(&mut self) -> fareflow_core::Result<Option<String>> { Ok(self.0.take()) }
//! }
//!
//! struct Events;
//! impl BatchOperator for Events {
//!     type Row = RideEvent;
//!     fn name(&self) -> &'static str { "events" }
//!     fn on_batch(&mut self, batch: &MicroBatch) -> Vec<RideEvent> { batch.events.clone() }
//! }
//!
//! struct Discard;
//! #[async_trait::async_trait]
//! impl BatchSink<RideEvent> for Discard {
//!     async fn write_batch(&mut self, _id: u64, _rows: &[RideEvent]) -> fareflow_core::Result<()> { Ok(()) }
//! }
//!
//! let mut exec = Executor::new(std::time::Duration::from_secs(10));
//! exec.source(OneLine(Some("{}".into()))).operator(Events).sink(Discard);
//! exec.run().await?;
//! # Ok(()) }
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument};

pub mod batch;
pub mod config;
pub mod event;
pub mod metrics;

pub use batch::{BatchAccumulator, MicroBatch};
pub use config::{DriverMode, PipelineConfig, WindowOutputMode};
pub use event::{format_timestamp, parse_event, ParseError, ParseErrorKind, RideEvent};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The event source went away or failed mid-stream.
    #[error("event source connection failed: {0}")]
    Connection(#[source] std::io::Error),
    #[error("failed to write batch output {}: {source}", path.display())]
    SinkWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A result row with a fixed CSV layout.
pub trait TabularRow: Send + Sync + 'static {
    const HEADER: &'static [&'static str];
    fn to_record(&self) -> Vec<String>;
}

/// Unbounded, non-restartable sequence of raw lines.
#[async_trait::async_trait]
pub trait LineSource: Send {
    /// Next line without its terminator; `Ok(None)` once the source has closed.
    async fn next_line(&mut self) -> Result<Option<String>>;
}

/// Folds one closed micro-batch into result rows. Any state lives in the operator itself.
pub trait BatchOperator: Send {
    type Row: TabularRow;
    fn name(&self) -> &'static str;
    fn on_batch(&mut self, batch: &MicroBatch) -> Vec<Self::Row>;
}

#[async_trait::async_trait]
pub trait BatchSink<R: TabularRow>: Send {
    /// Persist the rows of batch `batch_id`. Must not overwrite an earlier batch.
    async fn write_batch(&mut self, batch_id: u64, rows: &[R]) -> Result<()>;
}

/// Counters describing one executor run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub lines: u64,
    pub events: u64,
    pub dropped: u64,
    pub batches: u64,
    pub rows: u64,
}

type Shutdown = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Wires source -> parser -> accumulator -> operator -> sink.
///
/// The source runs in its own task and feeds lines through a channel; everything else runs
/// on the caller's task, so operator state and sink writes are never shared.
pub struct Executor<R: TabularRow> {
    source: Option<Box<dyn LineSource>>,
    operator: Option<Box<dyn BatchOperator<Row = R>>>,
    sink: Option<Box<dyn BatchSink<R>>>,
    trigger_interval: Duration,
    max_batch_size: Option<usize>,
    shutdown: Option<Shutdown>,
}

impl<R: TabularRow> Executor<R> {
    pub fn new(trigger_interval: Duration) -> Self {
        Self {
            source: None,
            operator: None,
            sink: None,
            trigger_interval,
            max_batch_size: None,
            shutdown: None,
        }
    }

    pub fn source<S: LineSource + 'static>(&mut self, s: S) -> &mut Self {
        self.source = Some(Box::new(s));
        self
    }

    pub fn operator<O: BatchOperator<Row = R> + 'static>(&mut self, o: O) -> &mut Self {
        self.operator = Some(Box::new(o));
        self
    }

    pub fn sink<K: BatchSink<R> + 'static>(&mut self, s: K) -> &mut Self {
        self.sink = Some(Box::new(s));
        self
    }

    pub fn max_batch_size(&mut self, max: Option<usize>) -> &mut Self {
        self.max_batch_size = max;
        self
    }

    /// Stop reading when `signal` completes; the pending batch is still flushed.
    pub fn shutdown_on<F>(&mut self, signal: F) -> &mut Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown = Some(Box::pin(signal));
        self
    }

    pub async fn run(&mut self) -> Result<RunSummary> {
        let mut source = self.source.take().ok_or_else(|| anyhow::anyhow!("no source"))?;
        let mut operator = self.operator.take().ok_or_else(|| anyhow::anyhow!("no operator"))?;
        let mut sink = self.sink.take().ok_or_else(|| anyhow::anyhow!("no sink"))?;
        let mut shutdown: Shutdown = self
            .shutdown
            .take()
            .unwrap_or_else(|| Box::pin(std::future::pending()));
        if self.trigger_interval.is_zero() {
            return Err(Error::Config("trigger interval must be positive".into()));
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let src_handle = tokio::spawn(async move {
            while let Some(line) = source.next_line().await? {
                if tx.send(line).is_err() {
                    break;
                }
                metrics::LINES_READ.inc();
            }
            Ok::<_, Error>(())
        });

        let mut acc = BatchAccumulator::new(self.max_batch_size);
        let mut ticker = tokio::time::interval(self.trigger_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        let mut summary = RunSummary::default();
        let mut interrupted = false;
        let consumed: Result<()> = async {
            loop {
                tokio::select! {
                    line = rx.recv() => {
                        let Some(line) = line else { break };
                        accept(&line, &mut acc, operator.as_mut(), sink.as_mut(), &mut summary).await?;
                    }
                    _ = ticker.tick() => {
                        if let Some(batch) = acc.close() {
                            emit(operator.as_mut(), sink.as_mut(), batch, &mut summary).await?;
                        }
                    }
                    _ = &mut shutdown => {
                        interrupted = true;
                        // lines already handed over by the source still belong to this run
                        rx.close();
                        while let Some(line) = rx.recv().await {
                            accept(&line, &mut acc, operator.as_mut(), sink.as_mut(), &mut summary).await?;
                        }
                        break;
                    }
                }
            }
            if let Some(batch) = acc.close() {
                emit(operator.as_mut(), sink.as_mut(), batch, &mut summary).await?;
            }
            Ok(())
        }
        .await;

        if consumed.is_err() || interrupted {
            src_handle.abort();
        }
        consumed?;
        if !interrupted {
            src_handle.await.map_err(|e| Error::Anyhow(anyhow::anyhow!(e)))??;
        }
        info!(
            lines = summary.lines,
            events = summary.events,
            dropped = summary.dropped,
            batches = summary.batches,
            rows = summary.rows,
            interrupted,
            "pipeline stopped"
        );
        Ok(summary)
    }
}

/// Parse one line into the accumulator, emitting a batch if the size bound closed one.
async fn accept<R: TabularRow>(
    line: &str,
    acc: &mut BatchAccumulator,
    operator: &mut dyn BatchOperator<Row = R>,
    sink: &mut dyn BatchSink<R>,
    summary: &mut RunSummary,
) -> Result<()> {
    summary.lines += 1;
    match parse_event(line) {
        Ok(event) => {
            summary.events += 1;
            metrics::EVENTS_BATCHED.inc();
            if let Some(batch) = acc.push(event) {
                emit(operator, sink, batch, summary).await?;
            }
        }
        Err(e) => {
            summary.dropped += 1;
            metrics::PARSE_ERRORS.with_label_values(&[e.kind.label()]).inc();
            debug!(error = %e, "dropping malformed line");
        }
    }
    Ok(())
}

#[instrument(name = "emit_batch", skip_all, fields(operator = operator.name(), batch_id = batch.id, events = batch.len()))]
async fn emit<R: TabularRow>(
    operator: &mut dyn BatchOperator<Row = R>,
    sink: &mut dyn BatchSink<R>,
    batch: MicroBatch,
    summary: &mut RunSummary,
) -> Result<()> {
    let started = Instant::now();
    let rows = operator.on_batch(&batch);
    sink.write_batch(batch.id, &rows).await?;
    summary.batches += 1;
    summary.rows += rows.len() as u64;
    metrics::BATCHES_EMITTED
        .with_label_values(&[operator.name()])
        .inc();
    metrics::BATCH_PROC_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);
    debug!(rows = rows.len(), "batch written");
    Ok(())
}

pub mod prelude {
    pub use super::{
        BatchAccumulator, BatchOperator, BatchSink, Executor, LineSource, MicroBatch, PipelineConfig,
        Result, RideEvent, RunSummary, TabularRow,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct VecSource {
        lines: std::vec::IntoIter<String>,
        fail_at_end: bool,
    }

    impl VecSource {
        fn new(lines: Vec<String>) -> Self {
            Self { lines: lines.into_iter(), fail_at_end: false }
        }
    }

    #[async_trait::async_trait]
    impl LineSource for VecSource {
        async fn next_line(&mut self) -> Result<Option<String>> {
            match self.lines.next() {
                Some(l) => Ok(Some(l)),
                None if self.fail_at_end => Err(Error::Connection(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "peer reset",
                ))),
                None => Ok(None),
            }
        }
    }

    struct Events;
    impl BatchOperator for Events {
        type Row = RideEvent;
        fn name(&self) -> &'static str {
            "events"
        }
        fn on_batch(&mut self, batch: &MicroBatch) -> Vec<RideEvent> {
            batch.events.clone()
        }
    }

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<(u64, Vec<RideEvent>)>>>);

    #[async_trait::async_trait]
    impl BatchSink<RideEvent> for Collect {
        async fn write_batch(&mut self, batch_id: u64, rows: &[RideEvent]) -> Result<()> {
            self.0.lock().unwrap().push((batch_id, rows.to_vec()));
            Ok(())
        }
    }

    struct Broken;
    #[async_trait::async_trait]
    impl BatchSink<RideEvent> for Broken {
        async fn write_batch(&mut self, batch_id: u64, _rows: &[RideEvent]) -> Result<()> {
            Err(Error::SinkWrite {
                path: PathBuf::from(format!("batch_id={batch_id}")),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            })
        }
    }

    fn line(n: usize) -> String {
        format!(
            r#"{{"trip_id":"t{n}","driver_id":{},"distance_km":1.5,"fare_amount":10.0,"timestamp":"2025-04-01 17:00:{:02}"}}"#,
            n % 4,
            n % 60
        )
    }

    #[tokio::test]
    async fn every_event_is_written_once_in_batch_order() {
        let mut lines: Vec<String> = (0..25).map(line).collect();
        lines.insert(7, "not json".into());
        lines.insert(12, r#"{"trip_id":"x"}"#.into());
        let sink = Collect::default();
        let mut exec = Executor::new(Duration::from_secs(3600));
        exec.source(VecSource::new(lines))
            .operator(Events)
            .sink(sink.clone())
            .max_batch_size(Some(4));
        let summary = exec.run().await.unwrap();

        assert_eq!(summary.lines, 27);
        assert_eq!(summary.events, 25);
        assert_eq!(summary.dropped, 2);
        assert_eq!(summary.batches, 7);
        assert_eq!(summary.rows, 25);

        let written = sink.0.lock().unwrap().clone();
        let ids: Vec<u64> = written.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, (0..7).collect::<Vec<_>>());
        let trips: Vec<String> = written
            .iter()
            .flat_map(|(_, rows)| rows.iter().map(|e| e.trip_id.clone()))
            .collect();
        assert_eq!(trips, (0..25).map(|n| format!("t{n}")).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn connection_error_surfaces_after_flushing_pending_batch() {
        let sink = Collect::default();
        let mut src = VecSource::new((0..3).map(line).collect());
        src.fail_at_end = true;
        let mut exec = Executor::new(Duration::from_secs(3600));
        exec.source(src).operator(Events).sink(sink.clone());
        let err = exec.run().await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)), "{err}");
        let written = sink.0.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].1.len(), 3);
    }

    #[tokio::test]
    async fn sink_failure_is_fatal() {
        let mut exec = Executor::new(Duration::from_secs(3600));
        exec.source(VecSource::new((0..2).map(line).collect()))
            .operator(Events)
            .sink(Broken);
        let err = exec.run().await.unwrap_err();
        assert!(matches!(err, Error::SinkWrite { .. }), "{err}");
    }

    #[tokio::test]
    async fn shutdown_flushes_what_was_read() {
        struct Stalled(Option<String>);
        #[async_trait::async_trait]
        impl LineSource for Stalled {
            async fn next_line(&mut self) -> Result<Option<String>> {
                match self.0.take() {
                    Some(l) => Ok(Some(l)),
                    None => std::future::pending().await,
                }
            }
        }

        let sink = Collect::default();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let mut exec = Executor::new(Duration::from_secs(3600));
        exec.source(Stalled(Some(line(1))))
            .operator(Events)
            .sink(sink.clone())
            .shutdown_on(async move {
                let _ = stop_rx.await;
            });
        let run = tokio::spawn(async move { exec.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(()).unwrap();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.events, 1);
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_keeps_every_line_already_handed_over() {
        // emits a burst as fast as it can, then signals and stalls
        struct Burst {
            next: usize,
            total: usize,
            drained: Option<tokio::sync::oneshot::Sender<()>>,
        }
        #[async_trait::async_trait]
        impl LineSource for Burst {
            async fn next_line(&mut self) -> Result<Option<String>> {
                if self.next < self.total {
                    self.next += 1;
                    return Ok(Some(line(self.next)));
                }
                if let Some(tx) = self.drained.take() {
                    let _ = tx.send(());
                }
                std::future::pending().await
            }
        }

        const TOTAL: usize = 50_000;
        let sink = Collect::default();
        let (drained_tx, drained_rx) = tokio::sync::oneshot::channel::<()>();
        let mut exec = Executor::new(Duration::from_secs(3600));
        exec.source(Burst { next: 0, total: TOTAL, drained: Some(drained_tx) })
            .operator(Events)
            .sink(sink.clone())
            .max_batch_size(Some(1_000))
            .shutdown_on(async move {
                let _ = drained_rx.await;
            });
        let summary = exec.run().await.unwrap();

        assert_eq!(summary.lines, TOTAL as u64);
        assert_eq!(summary.events, TOTAL as u64);
        let written = sink.0.lock().unwrap();
        let ids: Vec<u64> = written.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, (0..50).collect::<Vec<_>>());
        let trips: Vec<String> = written
            .iter()
            .flat_map(|(_, rows)| rows.iter().map(|e| e.trip_id.clone()))
            .collect();
        assert_eq!(trips, (1..=TOTAL).map(|n| format!("t{n}")).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn trigger_interval_closes_batches_on_the_clock() {
        struct Slow {
            lines: std::vec::IntoIter<String>,
            gap: Duration,
        }
        #[async_trait::async_trait]
        impl LineSource for Slow {
            async fn next_line(&mut self) -> Result<Option<String>> {
                tokio::time::sleep(self.gap).await;
                Ok(self.lines.next())
            }
        }

        let sink = Collect::default();
        let mut exec = Executor::new(Duration::from_millis(50));
        exec.source(Slow {
            lines: (0..4).map(line).collect::<Vec<_>>().into_iter(),
            gap: Duration::from_millis(150),
        })
        .operator(Events)
        .sink(sink.clone());
        let summary = exec.run().await.unwrap();

        // idle ticks between lines produce no batch and use no index
        let written = sink.0.lock().unwrap();
        let shape: Vec<(u64, usize)> = written.iter().map(|(id, rows)| (*id, rows.len())).collect();
        assert_eq!(shape, vec![(0, 1), (1, 1), (2, 1), (3, 1)]);
        let trips: Vec<&str> = written
            .iter()
            .flat_map(|(_, rows)| rows.iter().map(|e| e.trip_id.as_str()))
            .collect();
        assert_eq!(trips, vec!["t0", "t1", "t2", "t3"]);
        assert_eq!(summary.batches, 4);
    }

    #[tokio::test]
    async fn missing_stage_is_an_error() {
        let mut exec: Executor<RideEvent> = Executor::new(Duration::from_secs(1));
        exec.operator(Events);
        assert!(exec.run().await.is_err());
    }
}
