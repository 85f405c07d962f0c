//! Where each cycle's grid snapshot and coverage ratio go.

use coilsweep_middleware::{EventBus, Topic};
use coilsweep_types::{Event, EventPayload, GridSnapshot, SweepError};

/// Sink for the per-cycle coverage output.
///
/// Implementations must not block for long: `publish` runs on the coverage
/// loop's own task.
pub trait CoveragePublisher: Send {
    fn publish(&mut self, snapshot: GridSnapshot, coverage_ratio: f64) -> Result<(), SweepError>;
}

/// Publishes onto the [`EventBus`]: the snapshot on
/// [`Topic::OccupancyGrid`], the ratio on [`Topic::CoverageRate`].
#[derive(Debug, Clone)]
pub struct BusPublisher {
    bus: EventBus,
    source: String,
}

impl BusPublisher {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            source: "coilsweep-runtime::coverage_loop".to_string(),
        }
    }
}

impl CoveragePublisher for BusPublisher {
    /// Both topics are attempted even if the first has no listener; the
    /// first failure is returned.
    fn publish(&mut self, snapshot: GridSnapshot, coverage_ratio: f64) -> Result<(), SweepError> {
        let grid = self.bus.publish_to(
            Topic::OccupancyGrid,
            Event::new(&self.source, EventPayload::OccupancyGrid(snapshot)),
        );
        let rate = self.bus.publish_to(
            Topic::CoverageRate,
            Event::new(&self.source, EventPayload::CoverageRate(coverage_ratio as f32)),
        );
        grid.and(rate).map(|_| ())
    }
}
