//! [`PoseSampler`] – per-cycle coil position lookups.
//!
//! The sampler owns the ordered sensor set (e.g. left, middle and right
//! coil) and one [`PoseSource`] it asks for each coil's position in the field
//! frame.  A lookup failure never escapes as anything but
//! [`SweepError::PoseUnavailable`]; after a failure the sampler waits a short,
//! bounded back-off so a coil that is persistently missing cannot turn the
//! driver loop into a busy spin.
//!
//! The sampler keeps no "last known good" pose.  It does remember, per
//! sensor, whether a pose was ever seen and how many lookups in a row have
//! failed, purely to keep the logs readable.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use coilsweep_types::{SensorPose, SweepError};
use tracing::{debug, info, warn};

use crate::transform::TfEngine;

/// Back-off applied after a failed lookup.
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_millis(50);

/// Consecutive failures after which a sensor is reported as lost.
pub const DEFAULT_STALE_WARN_CYCLES: u32 = 30;

// ────────────────────────────────────────────────────────────────────────────
// PoseSource
// ────────────────────────────────────────────────────────────────────────────

/// Anything that can report where a named frame currently is.
pub trait PoseSource: Send + Sync {
    /// Position of `sensor_frame` expressed in `reference_frame`.
    fn lookup_position(
        &self,
        reference_frame: &str,
        sensor_frame: &str,
    ) -> Result<SensorPose, SweepError>;
}

/// [`PoseSource`] backed by a [`TfEngine`] shared with its broadcasters.
///
/// Chains containing an edge older than `max_age` are rejected, so a coil
/// whose broadcaster stopped is reported as unavailable.
#[derive(Debug, Clone)]
pub struct TfPoseSource {
    tf: Arc<RwLock<TfEngine>>,
    max_age: Duration,
}

impl TfPoseSource {
    pub fn new(tf: Arc<RwLock<TfEngine>>, max_age: Duration) -> Self {
        Self { tf, max_age }
    }
}

impl PoseSource for TfPoseSource {
    fn lookup_position(
        &self,
        reference_frame: &str,
        sensor_frame: &str,
    ) -> Result<SensorPose, SweepError> {
        let unavailable = |reason: String| SweepError::PoseUnavailable {
            frame: sensor_frame.to_string(),
            reason,
        };
        let tf = self
            .tf
            .read()
            .map_err(|_| unavailable("transform tree lock poisoned".to_string()))?;
        let t = tf
            .lookup_fresh(reference_frame, sensor_frame, self.max_age)
            .map_err(|e| unavailable(e.to_string()))?;
        Ok(SensorPose::new(
            t.translation.x,
            t.translation.y,
            t.translation.z,
        ))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Per-sensor bookkeeping
// ────────────────────────────────────────────────────────────────────────────

/// Long-term lookup state of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseState {
    /// No lookup for this sensor has ever succeeded.
    NoPoseYet,
    /// At least one lookup has succeeded.  A later failure does not undo
    /// this.
    HasPose,
}

#[derive(Debug)]
struct SensorTrack {
    frame: String,
    state: PoseState,
    failure_streak: u32,
}

// ────────────────────────────────────────────────────────────────────────────
// PoseSampler
// ────────────────────────────────────────────────────────────────────────────

/// Resolves each sensor's current position, isolating failures per sensor.
pub struct PoseSampler {
    reference_frame: String,
    sensors: Vec<SensorTrack>,
    source: Box<dyn PoseSource>,
    failure_backoff: Duration,
    stale_warn_cycles: u32,
}

impl PoseSampler {
    /// Build a sampler for `sensor_frames`, looked up relative to
    /// `reference_frame`.  The order of `sensor_frames` is the sampling
    /// order.
    ///
    /// # Errors
    ///
    /// [`SweepError::Config`] when the sensor set is empty or a frame name is
    /// blank.
    pub fn new<I, S>(
        reference_frame: impl Into<String>,
        sensor_frames: I,
        source: Box<dyn PoseSource>,
    ) -> Result<Self, SweepError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sensors: Vec<SensorTrack> = sensor_frames
            .into_iter()
            .map(|f| SensorTrack {
                frame: f.into(),
                state: PoseState::NoPoseYet,
                failure_streak: 0,
            })
            .collect();
        if sensors.is_empty() {
            return Err(SweepError::Config("sensor set is empty".to_string()));
        }
        if sensors.iter().any(|s| s.frame.trim().is_empty()) {
            return Err(SweepError::Config("sensor frame name is blank".to_string()));
        }
        Ok(Self {
            reference_frame: reference_frame.into(),
            sensors,
            source,
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
            stale_warn_cycles: DEFAULT_STALE_WARN_CYCLES,
        })
    }

    /// Override the wait applied after a failed lookup.
    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    /// Override how many consecutive failures produce a "sensor lost"
    /// warning.
    pub fn with_stale_warn_cycles(mut self, cycles: u32) -> Self {
        self.stale_warn_cycles = cycles.max(1);
        self
    }

    pub fn reference_frame(&self) -> &str {
        &self.reference_frame
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    pub fn sensor_frame(&self, index: usize) -> Option<&str> {
        self.sensors.get(index).map(|s| s.frame.as_str())
    }

    pub fn state(&self, index: usize) -> Option<PoseState> {
        self.sensors.get(index).map(|s| s.state)
    }

    /// Number of lookups in a row that have failed for sensor `index`.
    pub fn failure_streak(&self, index: usize) -> Option<u32> {
        self.sensors.get(index).map(|s| s.failure_streak)
    }

    /// Look up the current position of sensor `index`.
    ///
    /// On failure the configured back-off elapses before
    /// [`SweepError::PoseUnavailable`] is returned.
    pub async fn sample(&mut self, index: usize) -> Result<SensorPose, SweepError> {
        let Some(track) = self.sensors.get_mut(index) else {
            return Err(SweepError::PoseUnavailable {
                frame: format!("#{index}"),
                reason: "no such sensor".to_string(),
            });
        };

        match self
            .source
            .lookup_position(&self.reference_frame, &track.frame)
        {
            Ok(pose) => {
                if track.state == PoseState::NoPoseYet {
                    info!(sensor = %track.frame, x = pose.x, y = pose.y, "first pose acquired");
                } else if track.failure_streak >= self.stale_warn_cycles {
                    info!(sensor = %track.frame, missed = track.failure_streak, "pose recovered");
                }
                track.state = PoseState::HasPose;
                track.failure_streak = 0;
                Ok(pose)
            }
            Err(e) => {
                track.failure_streak = track.failure_streak.saturating_add(1);
                if track.failure_streak == self.stale_warn_cycles {
                    warn!(
                        sensor = %track.frame,
                        missed = track.failure_streak,
                        error = %e,
                        "pose lookups keep failing; sensor contributes no coverage"
                    );
                } else {
                    debug!(sensor = %track.frame, error = %e, "pose lookup failed");
                }
                if !self.failure_backoff.is_zero() {
                    tokio::time::sleep(self.failure_backoff).await;
                }
                Err(e)
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
