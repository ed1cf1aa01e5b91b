use chrono::{DateTime, Duration, Utc};

/// Policy that defines how to compute watermarks.
/// watermark = max_observed_event_time - delay
#[derive(Debug, Clone, Copy)]
pub struct WatermarkPolicy {
    pub delay: Duration,
}

impl WatermarkPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn from_millis(delay_ms: i64) -> Self {
        Self::new(Duration::milliseconds(delay_ms.max(0)))
    }
}

/// Tracks the largest event time seen and derives a watermark that never moves backwards.
#[derive(Debug, Clone)]
pub struct WatermarkClock {
    policy: WatermarkPolicy,
    max_observed: Option<DateTime<Utc>>,
}

impl WatermarkClock {
    pub fn new(policy: WatermarkPolicy) -> Self {
        Self {
            policy,
            max_observed: None,
        }
    }

    pub fn observe(&mut self, ts: DateTime<Utc>) {
        self.max_observed = Some(self.max_observed.map_or(ts, |max| max.max(ts)));
    }

    pub fn max_observed(&self) -> Option<DateTime<Utc>> {
        self.max_observed
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.max_observed.map(|t| t - self.policy.delay)
    }

    /// Whether a window ending at `end` is closed: `end <= watermark`.
    pub fn is_expired(&self, end: DateTime<Utc>) -> bool {
        self.watermark().is_some_and(|wm| end <= wm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances_with_observations_and_delay() {
        let mut clk = WatermarkClock::new(WatermarkPolicy::new(Duration::minutes(1)));
        let t0 = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let t1 = t0 + Duration::seconds(30);
        assert_eq!(clk.watermark(), None);
        assert!(!clk.is_expired(t0 - Duration::days(1)));

        clk.observe(t0);
        assert_eq!(clk.watermark(), Some(t0 - Duration::minutes(1)));
        clk.observe(t1);
        assert_eq!(clk.watermark(), Some(t1 - Duration::minutes(1)));
        // an older event never pulls the watermark back
        clk.observe(t0 - Duration::seconds(100));
        assert_eq!(clk.watermark(), Some(t1 - Duration::minutes(1)));
        assert_eq!(clk.max_observed(), Some(t1));
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let mut clk = WatermarkClock::new(WatermarkPolicy::from_millis(60_000));
        let t = DateTime::<Utc>::from_timestamp(1_700_000_360, 0).unwrap();
        clk.observe(t);
        let wm = t - Duration::minutes(1);
        assert!(clk.is_expired(wm));
        assert!(clk.is_expired(wm - Duration::seconds(1)));
        assert!(!clk.is_expired(wm + Duration::milliseconds(1)));
    }
}
