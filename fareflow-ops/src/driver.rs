use std::collections::{BTreeSet, HashMap};

use fareflow_core::{metrics, BatchOperator, DriverMode, MicroBatch, RideEvent, TabularRow};
use tracing::{debug, instrument};

/// Running sums for one driver. `count` backs the incremental average.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DriverTotals {
    pub total_fare: f64,
    pub total_distance: f64,
    pub count: u64,
}

impl DriverTotals {
    pub fn add(&mut self, ev: &RideEvent) {
        self.total_fare += ev.fare_amount;
        self.total_distance += ev.distance_km;
        self.count += 1;
    }

    pub fn avg_distance(&self) -> f64 {
        if self.count > 0 {
            self.total_distance / self.count as f64
        } else {
            0.0
        }
    }
}

/// One output row per driver.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverAggregate {
    pub driver_id: i64,
    pub total_fare: f64,
    pub avg_distance: f64,
}

impl DriverAggregate {
    fn from_totals(driver_id: i64, totals: &DriverTotals) -> Self {
        Self {
            driver_id,
            total_fare: totals.total_fare,
            avg_distance: totals.avg_distance(),
        }
    }
}

impl TabularRow for DriverAggregate {
    const HEADER: &'static [&'static str] = &["driver_id", "total_fare", "avg_distance"];

    fn to_record(&self) -> Vec<String> {
        vec![
            self.driver_id.to_string(),
            self.total_fare.to_string(),
            self.avg_distance.to_string(),
        ]
    }
}

/// Per-driver totals owned by a stateful [`DriverAggregator`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverState {
    totals: HashMap<i64, DriverTotals>,
}

impl DriverState {
    pub fn get(&self, driver_id: i64) -> Option<&DriverTotals> {
        self.totals.get(&driver_id)
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    fn fold(&mut self, events: &[RideEvent]) -> BTreeSet<i64> {
        let mut touched = BTreeSet::new();
        for ev in events {
            self.totals.entry(ev.driver_id).or_default().add(ev);
            touched.insert(ev.driver_id);
        }
        touched
    }

    /// All drivers, ordered by id.
    pub fn snapshot(&self) -> Vec<DriverAggregate> {
        let mut rows: Vec<_> = self
            .totals
            .iter()
            .map(|(id, t)| DriverAggregate::from_totals(*id, t))
            .collect();
        rows.sort_by_key(|r| r.driver_id);
        rows
    }

    fn rows_for(&self, ids: &BTreeSet<i64>) -> Vec<DriverAggregate> {
        ids.iter()
            .filter_map(|id| self.totals.get(id).map(|t| DriverAggregate::from_totals(*id, t)))
            .collect()
    }
}

/// Total fare and average distance per driver.
///
/// Emits one row for each driver present in the batch. In [`DriverMode::Stateful`] the row
/// carries all-time totals, in [`DriverMode::Stateless`] only this batch's.
pub struct DriverAggregator {
    mode: DriverMode,
    state: DriverState,
}

impl DriverAggregator {
    pub fn new(mode: DriverMode) -> Self {
        Self {
            mode,
            state: DriverState::default(),
        }
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    #[instrument(name = "driver_fold", skip_all, fields(batch_id = batch.id, mode = ?self.mode))]
    pub fn fold(&mut self, batch: &MicroBatch) -> Vec<DriverAggregate> {
        let rows = match self.mode {
            DriverMode::Stateless => {
                let mut local = DriverState::default();
                let touched = local.fold(&batch.events);
                local.rows_for(&touched)
            }
            DriverMode::Stateful => {
                let touched = self.state.fold(&batch.events);
                metrics::STATE_SIZE
                    .with_label_values(&["drivers"])
                    .set(self.state.len() as i64);
                self.state.rows_for(&touched)
            }
        };
        debug!(drivers = rows.len(), "drivers folded");
        rows
    }
}

impl BatchOperator for DriverAggregator {
    type Row = DriverAggregate;

    fn name(&self) -> &'static str {
        "drivers"
    }

    fn on_batch(&mut self, batch: &MicroBatch) -> Vec<DriverAggregate> {
        self.fold(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fareflow_core::parse_event;

    fn ride(trip: &str, driver_id: i64, distance_km: f64, fare_amount: f64) -> RideEvent {
        RideEvent {
            trip_id: trip.into(),
            driver_id,
            distance_km,
            fare_amount,
            event_time: Utc.with_ymd_and_hms(2025, 4, 1, 17, 0, 0).unwrap(),
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn two_trips_for_one_driver() {
        let events = [
            r#"{"trip_id":"t1","driver_id":23,"distance_km":12.3,"fare_amount":45.6,"timestamp":"2025-04-01 17:00:12"}"#,
            r#"{"trip_id":"t2","driver_id":23,"distance_km":13.3,"fare_amount":50.0,"timestamp":"2025-04-01 17:00:45"}"#,
        ]
        .iter()
        .map(|l| parse_event(l).unwrap())
        .collect();
        let mut agg = DriverAggregator::new(DriverMode::Stateful);
        let rows = agg.fold(&MicroBatch { id: 0, events });
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].driver_id, 23);
        assert!(close(rows[0].total_fare, 95.6), "{}", rows[0].total_fare);
        assert!(close(rows[0].avg_distance, 12.8), "{}", rows[0].avg_distance);
        assert_eq!(agg.state().get(23).map(|t| t.count), Some(2));
    }

    #[test]
    fn stateful_totals_span_all_batches() {
        let batches = vec![
            vec![ride("a", 1, 2.0, 10.0), ride("b", 2, 4.0, 20.0)],
            vec![ride("c", 1, 6.0, 5.0)],
            vec![ride("d", 3, 1.0, 1.0), ride("e", 1, 1.0, 2.5)],
        ];
        let mut agg = DriverAggregator::new(DriverMode::Stateful);
        let mut last = Vec::new();
        for (id, events) in batches.iter().enumerate() {
            last = agg.fold(&MicroBatch { id: id as u64, events: events.clone() });
        }
        // only drivers present in the last batch are emitted, with cumulative values
        let ids: Vec<i64> = last.iter().map(|r| r.driver_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(close(last[0].total_fare, 17.5));
        assert!(close(last[0].avg_distance, 3.0));

        let all = agg.state().snapshot();
        assert_eq!(all.len(), 3);
        for row in &all {
            let mine: Vec<&RideEvent> = batches
                .iter()
                .flatten()
                .filter(|e| e.driver_id == row.driver_id)
                .collect();
            let fare: f64 = mine.iter().map(|e| e.fare_amount).sum();
            let dist: f64 = mine.iter().map(|e| e.distance_km).sum::<f64>() / mine.len() as f64;
            assert!(close(row.total_fare, fare));
            assert!(close(row.avg_distance, dist));
        }
    }

    #[test]
    fn stateless_resets_every_batch() {
        let mut agg = DriverAggregator::new(DriverMode::Stateless);
        agg.fold(&MicroBatch { id: 0, events: vec![ride("a", 7, 10.0, 30.0)] });
        let rows = agg.fold(&MicroBatch {
            id: 1,
            events: vec![ride("b", 7, 2.0, 4.0), ride("c", 7, 4.0, 6.0)],
        });
        assert_eq!(
            rows,
            vec![DriverAggregate { driver_id: 7, total_fare: 10.0, avg_distance: 3.0 }]
        );
        assert!(agg.state().is_empty());
    }


    #[test]
    fn row_matches_header() {
        let row = DriverAggregate { driver_id: 23, total_fare: 95.5, avg_distance: 12.75 };
        assert_eq!(row.to_record(), vec!["23", "95.5", "12.75"]);
        assert_eq!(DriverAggregate::HEADER.len(), 3);
    }
}
