//! fareflow-ops: batch operators built on top of fareflow-core.
//!
//! Included operators:
//! - `ParsedEvents`: passes parsed rides through unchanged (raw ingestion job)
//! - `DriverAggregator`: total fare and average distance per driver, stateless or cumulative
//! - `WindowFareAggregator`: summed fare per sliding event-time window with a watermark

use fareflow_core::{BatchOperator, MicroBatch, RideEvent};
use tracing::instrument;

pub mod driver;
pub mod time;
pub mod window;

pub use driver::{DriverAggregate, DriverAggregator, DriverState, DriverTotals};
pub use time::{WatermarkClock, WatermarkPolicy};
pub use window::{SlidingWindows, Window, WindowAggregate, WindowFareAggregator};

/// Identity operator: every parsed event becomes an output row.
///
/// Example
/// ```no_run
/// use fareflow_ops::ParsedEvents;
/// let op = ParsedEvents;
/// # let _ = op;
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ParsedEvents;

impl BatchOperator for ParsedEvents {
    type Row = RideEvent;

    fn name(&self) -> &'static str {
        "events"
    }

    #[instrument(name = "events_on_batch", skip_all, fields(batch_id = batch.id))]
    fn on_batch(&mut self, batch: &MicroBatch) -> Vec<RideEvent> {
        batch.events.clone()
    }
}

pub mod prelude {
    pub use super::{
        DriverAggregate, DriverAggregator, ParsedEvents, SlidingWindows, WatermarkPolicy,
        WindowAggregate, WindowFareAggregator,
    };
}
