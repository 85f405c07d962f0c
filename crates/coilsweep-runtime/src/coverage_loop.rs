//! [`CoverageLoop`] – the fixed-rate driver.
//!
//! Each cycle:
//!
//! 1. **Sample** – ask the [`PoseSampler`] for every coil, in configured
//!    order.  A failed lookup skips that coil for this cycle only.
//! 2. **Stamp** – every coil that resolved stamps its
//!    [`DetectionFootprint`] onto the [`CoverageGrid`].
//! 3. **Publish** – snapshot the grid, lift it to the most recent coil
//!    height minus the clearance, and hand it to the [`CoveragePublisher`]
//!    together with the coverage ratio.
//!
//! The grid is owned by the loop and only touched from its task, so every
//! snapshot is consistent with the covered count it is published with.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::{Arc, RwLock, atomic::AtomicBool};
//! use std::time::Duration;
//! use coilsweep_middleware::EventBus;
//! use coilsweep_perception::{CoverageGrid, DetectionFootprint, PoseSampler, TfEngine, TfPoseSource};
//! use coilsweep_runtime::{BusPublisher, CoverageLoop, CoverageLoopConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), coilsweep_types::SweepError> {
//! let tf = Arc::new(RwLock::new(TfEngine::new()));
//! let sampler = PoseSampler::new(
//!     "minefield",
//!     ["left_coil", "middle_coil", "right_coil"],
//!     Box::new(TfPoseSource::new(tf, Duration::from_millis(500))),
//! )?;
//! let mut driver = CoverageLoop::new(
//!     CoverageGrid::new(0.1, 100, 100)?,
//!     sampler,
//!     DetectionFootprint::new(0.3, 0.1)?,
//!     Box::new(BusPublisher::new(EventBus::default())),
//!     CoverageLoopConfig::default(),
//! )?;
//! driver.run(Arc::new(AtomicBool::new(false)), None).await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use coilsweep_perception::{CoverageGrid, DetectionFootprint, PoseSampler};
use coilsweep_types::SweepError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument};

use crate::publisher::CoveragePublisher;

/// Height below the coils at which the grid is drawn.
pub const DEFAULT_CLEARANCE: f64 = 0.30;

/// Cycle rate of the driver loop.
pub const DEFAULT_RATE_HZ: f64 = 30.0;

/// Seconds between "coverage progress" log lines.
const PROGRESS_LOG_PERIOD_SECS: f64 = 10.0;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`CoverageLoop`].
#[derive(Debug, Clone)]
pub struct CoverageLoopConfig {
    /// Target cycles per second.
    pub rate_hz: f64,
    /// Subtracted from the last coil height to place the published grid.
    /// Display only.
    pub clearance: f64,
    /// Frame id stamped on every published snapshot.
    pub frame_id: String,
}

impl Default for CoverageLoopConfig {
    fn default() -> Self {
        Self {
            rate_hz: DEFAULT_RATE_HZ,
            clearance: DEFAULT_CLEARANCE,
            frame_id: "minefield".to_string(),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CycleReport {
    /// Coils whose pose resolved.
    pub sampled: usize,
    /// Coils skipped because their pose was unavailable.
    pub skipped: usize,
    /// Cells that went from unscanned to covered.
    pub newly_covered: usize,
    /// Ratio published at the end of the cycle.
    pub coverage_ratio: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// CoverageLoop
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the grid, the sampler and the publisher; advances them one cycle at
/// a time.
pub struct CoverageLoop {
    grid: CoverageGrid,
    sampler: PoseSampler,
    footprint: DetectionFootprint,
    publisher: Box<dyn CoveragePublisher>,
    config: CoverageLoopConfig,
    /// Time between ticks, derived from `rate_hz`.
    period: Duration,
    /// Height of the most recent coil that resolved, in any cycle.
    last_sensor_z: f64,
    cycles: u64,
}

impl CoverageLoop {
    /// # Errors
    ///
    /// [`SweepError::Config`] when `rate_hz` is not a positive finite number
    /// or its period is not representable (rounds to zero, or overflows).
    pub fn new(
        grid: CoverageGrid,
        sampler: PoseSampler,
        footprint: DetectionFootprint,
        publisher: Box<dyn CoveragePublisher>,
        config: CoverageLoopConfig,
    ) -> Result<Self, SweepError> {
        let period = tick_period(config.rate_hz)?;
        info!(
            width = grid.width(),
            height = grid.height(),
            resolution = grid.resolution(),
            cell_radius = footprint.cell_radius(),
            sensors = sampler.sensor_count(),
            "coverage loop initialised"
        );
        Ok(Self {
            grid,
            sampler,
            footprint,
            publisher,
            config,
            period,
            last_sensor_z: 0.0,
            cycles: 0,
        })
    }

    pub fn grid(&self) -> &CoverageGrid {
        &self.grid
    }

    pub fn sampler(&self) -> &PoseSampler {
        &self.sampler
    }

    /// Cycles completed so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run one sample → stamp → publish cycle.
    ///
    /// Never fails: unavailable poses skip their coil, and a publication
    /// nobody listens to is only logged.
    #[instrument(skip(self), fields(cycle = self.cycles))]
    pub async fn tick(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let cell_radius = self.footprint.cell_radius();

        for index in 0..self.sampler.sensor_count() {
            match self.sampler.sample(index).await {
                Ok(pose) => {
                    report.sampled += 1;
                    report.newly_covered += self.grid.mark_covered(pose.x, pose.y, cell_radius);
                    self.last_sensor_z = pose.z;
                }
                Err(_) => report.skipped += 1,
            }
        }

        report.coverage_ratio = self.grid.coverage_ratio();
        let snapshot = self.grid.snapshot(
            &self.config.frame_id,
            Utc::now(),
            self.last_sensor_z - self.config.clearance,
        );
        if let Err(e) = self.publisher.publish(snapshot, report.coverage_ratio) {
            debug!(error = %e, "coverage output not delivered");
        }

        self.cycles += 1;
        debug!(
            sampled = report.sampled,
            skipped = report.skipped,
            newly_covered = report.newly_covered,
            ratio = report.coverage_ratio,
            "cycle complete"
        );
        report
    }

    /// Tick at `rate_hz` until `shutdown` is set or `max_cycles` cycles have
    /// run.  Returns the number of cycles run by this call.
    ///
    /// A cycle that overruns its period delays the next one rather than
    /// triggering a burst of catch-up ticks.
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>, max_cycles: Option<u64>) -> u64 {
        let period = self.period;
        let progress_every = ((self.config.rate_hz * PROGRESS_LOG_PERIOD_SECS) as u64).max(1);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(rate_hz = self.config.rate_hz, "coverage loop running");
        let mut ran = 0;
        while !shutdown.load(Ordering::Acquire) {
            if max_cycles.is_some_and(|limit| ran >= limit) {
                break;
            }
            interval.tick().await;
            let report = self.tick().await;
            ran += 1;
            if ran % progress_every == 0 {
                info!(
                    cycles = self.cycles,
                    covered = self.grid.covered_count(),
                    ratio = report.coverage_ratio,
                    "coverage progress"
                );
            }
        }

        info!(
            cycles = ran,
            covered = self.grid.covered_count(),
            ratio = self.grid.coverage_ratio(),
            "coverage loop stopped"
        );
        ran
    }
}

fn tick_period(rate_hz: f64) -> Result<Duration, SweepError> {
    if !(rate_hz.is_finite() && rate_hz > 0.0) {
        return Err(SweepError::Config(format!(
            "loop rate must be positive, got {rate_hz}"
        )));
    }
    Duration::try_from_secs_f64(1.0 / rate_hz)
        .ok()
        .filter(|p| !p.is_zero())
        .ok_or_else(|| SweepError::Config(format!("loop rate {rate_hz} Hz has no usable period")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use coilsweep_perception::PoseSource;
    use coilsweep_types::{GridSnapshot, SensorPose};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Pose source answering from a mutable table; missing entries fail.
    #[derive(Clone, Default)]
    struct TablePoses(Arc<Mutex<HashMap<String, SensorPose>>>);

    impl TablePoses {
        fn set(&self, frame: &str, pose: SensorPose) {
            self.0.lock().unwrap().insert(frame.to_string(), pose);
        }

        fn clear(&self, frame: &str) {
            self.0.lock().unwrap().remove(frame);
        }
    }

    impl PoseSource for TablePoses {
        fn lookup_position(&self, _reference: &str, frame: &str) -> Result<SensorPose, SweepError> {
            self.0
                .lock()
                .unwrap()
                .get(frame)
                .copied()
                .ok_or_else(|| SweepError::PoseUnavailable {
                    frame: frame.to_string(),
                    reason: "not broadcast".to_string(),
                })
        }
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<(GridSnapshot, f64)>>>);

    impl CoveragePublisher for Captured {
        fn publish(&mut self, snapshot: GridSnapshot, ratio: f64) -> Result<(), SweepError> {
            self.0.lock().unwrap().push((snapshot, ratio));
            Ok(())
        }
    }

    fn build(poses: &TablePoses, captured: &Captured, cell_radius: i64) -> CoverageLoop {
        let sampler = PoseSampler::new(
            "minefield",
            ["left_coil", "middle_coil", "right_coil"],
            Box::new(poses.clone()),
        )
        .unwrap()
        .with_failure_backoff(Duration::ZERO);
        CoverageLoop::new(
            CoverageGrid::new(1.0, 10, 10).unwrap(),
            sampler,
            DetectionFootprint::from_cells(cell_radius),
            Box::new(captured.clone()),
            CoverageLoopConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn new_rejects_non_positive_rate() {
        let poses = TablePoses::default();
        let sampler = PoseSampler::new("minefield", ["c"], Box::new(poses)).unwrap();
        let result = CoverageLoop::new(
            CoverageGrid::new(1.0, 4, 4).unwrap(),
            sampler,
            DetectionFootprint::from_cells(1),
            Box::new(Captured::default()),
            CoverageLoopConfig {
                rate_hz: 0.0,
                ..CoverageLoopConfig::default()
            },
        );
        assert!(matches!(result, Err(SweepError::Config(_))));
    }

    #[test]
    fn new_rejects_rate_without_usable_period() {
        for rate_hz in [1e10, 1e-320] {
            let poses = TablePoses::default();
            let sampler = PoseSampler::new("minefield", ["c"], Box::new(poses)).unwrap();
            let result = CoverageLoop::new(
                CoverageGrid::new(1.0, 4, 4).unwrap(),
                sampler,
                DetectionFootprint::from_cells(1),
                Box::new(Captured::default()),
                CoverageLoopConfig {
                    rate_hz,
                    ..CoverageLoopConfig::default()
                },
            );
            assert!(matches!(result, Err(SweepError::Config(_))), "rate {rate_hz} accepted");
        }
    }

    #[tokio::test]
    async fn fast_but_representable_rate_runs() {
        let poses = TablePoses::default();
        let captured = Captured::default();
        let sampler = PoseSampler::new("minefield", ["c"], Box::new(poses))
            .unwrap()
            .with_failure_backoff(Duration::ZERO);
        let mut driver = CoverageLoop::new(
            CoverageGrid::new(1.0, 4, 4).unwrap(),
            sampler,
            DetectionFootprint::from_cells(1),
            Box::new(captured.clone()),
            CoverageLoopConfig {
                rate_hz: 1e6,
                ..CoverageLoopConfig::default()
            },
        )
        .unwrap();
        assert_eq!(driver.run(Arc::new(AtomicBool::new(false)), Some(1)).await, 1);
    }

    #[tokio::test]
    async fn tick_with_no_poses_publishes_empty_grid() {
        let poses = TablePoses::default();
        let captured = Captured::default();
        let mut driver = build(&poses, &captured, 2);

        let report = driver.tick().await;
        assert_eq!(report.sampled, 0);
        assert_eq!(report.skipped, 3);
        assert_eq!(report.coverage_ratio, 0.0);

        let published = captured.0.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0.covered_cells(), 0);
        // No coil height seen yet: grid sits at -clearance.
        assert!((published[0].0.origin.z - -DEFAULT_CLEARANCE).abs() < 1e-12);
    }

    #[tokio::test]
    async fn tick_stamps_every_resolved_coil() {
        let poses = TablePoses::default();
        let captured = Captured::default();
        let mut driver = build(&poses, &captured, 1);
        poses.set("left_coil", SensorPose::new(-2.0, 0.0, 0.5));
        poses.set("right_coil", SensorPose::new(2.0, 0.0, 0.6));

        let report = driver.tick().await;
        assert_eq!(report.sampled, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.newly_covered, 6);
        assert_eq!(driver.grid().covered_count(), 6);
        assert!((report.coverage_ratio - 0.06).abs() < 1e-12);

        let published = captured.0.lock().unwrap();
        let (snapshot, ratio) = &published[0];
        assert_eq!(snapshot.covered_cells(), 6);
        assert!((ratio - 0.06).abs() < 1e-12);
        // Height follows the last coil that resolved (right_coil).
        assert!((snapshot.origin.z - (0.6 - DEFAULT_CLEARANCE)).abs() < 1e-12);
        assert_eq!(snapshot.frame_id, "minefield");
    }

    #[tokio::test]
    async fn height_persists_across_cycles_without_poses() {
        let poses = TablePoses::default();
        let captured = Captured::default();
        let mut driver = build(&poses, &captured, 1);
        poses.set("middle_coil", SensorPose::new(0.0, 0.0, 1.0));
        driver.tick().await;
        poses.clear("middle_coil");
        driver.tick().await;

        let published = captured.0.lock().unwrap();
        assert!((published[1].0.origin.z - (1.0 - DEFAULT_CLEARANCE)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn run_stops_after_max_cycles() {
        let poses = TablePoses::default();
        let captured = Captured::default();
        let mut driver = build(&poses, &captured, 1);
        poses.set("middle_coil", SensorPose::new(0.0, 0.0, 0.0));

        let ran = driver.run(Arc::new(AtomicBool::new(false)), Some(3)).await;
        assert_eq!(ran, 3);
        assert_eq!(driver.cycles(), 3);
        assert_eq!(captured.0.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn run_returns_immediately_when_already_shut_down() {
        let poses = TablePoses::default();
        let captured = Captured::default();
        let mut driver = build(&poses, &captured, 1);
        let ran = driver.run(Arc::new(AtomicBool::new(true)), None).await;
        assert_eq!(ran, 0);
        assert!(captured.0.lock().unwrap().is_empty());
    }
}
