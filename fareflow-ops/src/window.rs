use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use fareflow_core::{
    format_timestamp, metrics, BatchOperator, Error, MicroBatch, PipelineConfig, TabularRow,
    WindowOutputMode,
};
use tracing::{debug, instrument};

use crate::time::{WatermarkClock, WatermarkPolicy};

/// Half-open event-time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// Fixed-size windows starting at every multiple of `slide` since the Unix epoch.
/// `size == slide` gives tumbling windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindows {
    size_ms: i64,
    slide_ms: i64,
}

impl SlidingWindows {
    pub fn new(size_ms: i64, slide_ms: i64) -> fareflow_core::Result<Self> {
        if size_ms <= 0 || slide_ms <= 0 {
            return Err(Error::Config("window size and slide must be positive".into()));
        }
        if size_ms % slide_ms != 0 {
            return Err(Error::Config(format!(
                "window size {size_ms}ms is not a multiple of slide {slide_ms}ms"
            )));
        }
        Ok(Self { size_ms, slide_ms })
    }

    /// Every window containing `ts`, oldest first.
    pub fn assign(&self, ts: DateTime<Utc>) -> Vec<Window> {
        let ts_ms = ts.timestamp_millis();
        let last_start = ts_ms - ts_ms.rem_euclid(self.slide_ms);
        let mut out = Vec::with_capacity((self.size_ms / self.slide_ms) as usize);
        let mut start = last_start;
        while start + self.size_ms > ts_ms {
            if let (Some(s), Some(e)) = (
                DateTime::<Utc>::from_timestamp_millis(start),
                DateTime::<Utc>::from_timestamp_millis(start + self.size_ms),
            ) {
                out.push(Window { start: s, end: e });
            }
            start -= self.slide_ms;
        }
        out.reverse();
        out
    }
}

/// One output row: summed fare of a window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowAggregate {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_fare: f64,
}

impl TabularRow for WindowAggregate {
    const HEADER: &'static [&'static str] = &["window_start", "window_end", "total_fare"];

    fn to_record(&self) -> Vec<String> {
        vec![
            format_timestamp(&self.window_start),
            format_timestamp(&self.window_end),
            self.total_fare.to_string(),
        ]
    }
}

/// Sums `fare_amount` per sliding window, with watermark-based expiry.
///
/// Within a batch, contributions are checked against the watermark left by earlier batches;
/// the watermark then advances to `max(event_time) - delay`. Windows with
/// `end <= watermark` are closed: they reject further contributions and are evicted.
pub struct WindowFareAggregator {
    windows: SlidingWindows,
    clock: WatermarkClock,
    mode: WindowOutputMode,
    state: BTreeMap<Window, f64>,
}

impl WindowFareAggregator {
    pub fn new(windows: SlidingWindows, policy: WatermarkPolicy, mode: WindowOutputMode) -> Self {
        Self {
            windows,
            clock: WatermarkClock::new(policy),
            mode,
            state: BTreeMap::new(),
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> fareflow_core::Result<Self> {
        let windows = SlidingWindows::new(cfg.window_duration_ms()?, cfg.slide_interval_ms()?)?;
        let policy = WatermarkPolicy::from_millis(cfg.watermark_delay_ms()?);
        Ok(Self::new(windows, policy, cfg.window_output_mode))
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.clock.watermark()
    }

    /// Running total of a window that is still open.
    pub fn total(&self, window: &Window) -> Option<f64> {
        self.state.get(window).copied()
    }

    pub fn open_windows(&self) -> usize {
        self.state.len()
    }

    #[instrument(name = "window_fold", skip_all, fields(batch_id = batch.id))]
    pub fn fold(&mut self, batch: &MicroBatch) -> Vec<WindowAggregate> {
        let mut touched = BTreeSet::new();
        let mut late = 0u64;
        for ev in &batch.events {
            for w in self.windows.assign(ev.event_time) {
                if self.clock.is_expired(w.end) {
                    late += 1;
                    continue;
                }
                *self.state.entry(w).or_insert(0.0) += ev.fare_amount;
                touched.insert(w);
            }
        }
        if let Some(max) = batch.max_event_time() {
            self.clock.observe(max);
        }

        let closed: Vec<Window> = self
            .state
            .keys()
            .copied()
            .filter(|w| self.clock.is_expired(w.end))
            .collect();
        let emit: Vec<Window> = match self.mode {
            WindowOutputMode::Update => touched.into_iter().collect(),
            WindowOutputMode::Append => closed.clone(),
        };
        let rows = emit
            .iter()
            .filter_map(|w| {
                self.state.get(w).map(|total| WindowAggregate {
                    window_start: w.start,
                    window_end: w.end,
                    total_fare: *total,
                })
            })
            .collect();
        for w in &closed {
            self.state.remove(w);
        }

        if late > 0 {
            metrics::LATE_CONTRIBUTIONS.inc_by(late);
        }
        if let Some(wm) = self.clock.watermark() {
            metrics::WATERMARK_MS.set(wm.timestamp_millis());
        }
        metrics::STATE_SIZE
            .with_label_values(&["windows"])
            .set(self.state.len() as i64);
        debug!(late, closed = closed.len(), open = self.state.len(), "windows folded");
        rows
    }
}

impl BatchOperator for WindowFareAggregator {
    type Row = WindowAggregate;

    fn name(&self) -> &'static str {
        "windows"
    }

    fn on_batch(&mut self, batch: &MicroBatch) -> Vec<WindowAggregate> {
        self.fold(batch)
    }
}
