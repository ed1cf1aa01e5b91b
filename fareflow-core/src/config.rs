use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How the driver aggregation treats state between batches.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverMode {
    /// Totals reset every batch.
    Stateless,
    /// Totals accumulate for the lifetime of the job.
    #[default]
    Stateful,
}

/// Which windows the window aggregation emits per batch.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WindowOutputMode {
    /// Every window touched by the batch, with its running total.
    #[default]
    Update,
    /// Only windows the watermark has closed, each exactly once.
    Append,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub host: String,
    pub port: u16,
    pub trigger_interval: String, // e.g., "10s"
    pub window_duration: String,  // e.g., "5m"
    pub slide_interval: String,   // e.g., "1m"
    pub watermark_delay: String,  // e.g., "1m"
    pub output_root: PathBuf,
    pub driver_mode: DriverMode,
    pub window_output_mode: WindowOutputMode,
    /// Close a batch early once it holds this many events.
    pub max_batch_size: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 9999,
            trigger_interval: "10s".into(),
            window_duration: "5m".into(),
            slide_interval: "1m".into(),
            watermark_delay: "1m".into(),
            output_root: PathBuf::from("output"),
            driver_mode: DriverMode::default(),
            window_output_mode: WindowOutputMode::default(),
            max_batch_size: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("host must not be empty");
        }
        if self.port == 0 {
            anyhow::bail!("port must be non-zero");
        }
        let trigger = self.trigger_interval_ms()?;
        let window = self.window_duration_ms()?;
        let slide = self.slide_interval_ms()?;
        let delay = self.watermark_delay_ms()?;
        for (name, ms) in [
            ("trigger_interval", trigger),
            ("window_duration", window),
            ("slide_interval", slide),
        ] {
            if ms <= 0 {
                anyhow::bail!("{name} must be positive");
            }
        }
        if delay < 0 {
            anyhow::bail!("watermark_delay must not be negative");
        }
        if window % slide != 0 {
            anyhow::bail!(
                "window_duration ({}) must be a whole multiple of slide_interval ({})",
                self.window_duration,
                self.slide_interval
            );
        }
        if self.max_batch_size == Some(0) {
            anyhow::bail!("max_batch_size must be positive when set");
        }
        Ok(())
    }

    pub fn trigger_interval_ms(&self) -> anyhow::Result<i64> {
        parse_duration_ms(&self.trigger_interval)
    }

    pub fn window_duration_ms(&self) -> anyhow::Result<i64> {
        parse_duration_ms(&self.window_duration)
    }

    pub fn slide_interval_ms(&self) -> anyhow::Result<i64> {
        parse_duration_ms(&self.slide_interval)
    }

    pub fn watermark_delay_ms(&self) -> anyhow::Result<i64> {
        parse_duration_ms(&self.watermark_delay)
    }

    /// Trigger period as a std duration, for the executor's timer.
    pub fn trigger_interval(&self) -> anyhow::Result<Duration> {
        let ms = self.trigger_interval_ms()?;
        anyhow::ensure!(ms > 0, "trigger_interval must be positive");
        Ok(Duration::from_millis(ms as u64))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn parse_duration_ms(s: &str) -> anyhow::Result<i64> {
    // accepts "500ms", "10s", "5m", "1h"; a bare number means seconds
    let s = s.trim();
    let parse = |num: &str, scale: i64| -> anyhow::Result<i64> {
        let n = num
            .trim()
            .parse::<i64>()
            .map_err(|e| anyhow::anyhow!("invalid duration {s:?}: {e}"))?;
        n.checked_mul(scale)
            .ok_or_else(|| anyhow::anyhow!("duration {s:?} overflows"))
    };
    if let Some(num) = s.strip_suffix("ms") {
        return parse(num, 1);
    }
    if let Some(num) = s.strip_suffix('s') {
        return parse(num, 1_000);
    }
    if let Some(num) = s.strip_suffix('m') {
        return parse(num, 60_000);
    }
    if let Some(num) = s.strip_suffix('h') {
        return parse(num, 3_600_000);
    }
    parse(s, 1_000)
}
