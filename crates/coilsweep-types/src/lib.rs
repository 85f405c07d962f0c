use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Logical coverage state of a single grid cell.
///
/// Only two states matter for coverage accounting.  The published grid maps
/// them onto an occupancy scale via [`CellState::occupancy_value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CellState {
    /// No coil has swept this cell yet (drawn grey).
    #[default]
    Unscanned,
    /// At least one coil footprint has covered this cell (drawn white).
    Covered,
}

impl CellState {
    /// Occupancy value published for unscanned cells.
    pub const UNSCANNED_VALUE: i8 = 50;
    /// Occupancy value published for covered cells.
    pub const COVERED_VALUE: i8 = 0;

    /// Value on the 0–100 occupancy scale used by grid consumers.
    pub fn occupancy_value(self) -> i8 {
        match self {
            CellState::Unscanned => Self::UNSCANNED_VALUE,
            CellState::Covered => Self::COVERED_VALUE,
        }
    }

    pub fn is_covered(self) -> bool {
        matches!(self, CellState::Covered)
    }
}

/// World-frame position of one sensor, sampled for a single cycle.
///
/// A failed lookup is represented by `Err(SweepError::PoseUnavailable)`
/// rather than a validity flag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorPose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl SensorPose {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// World coordinates of grid cell (0, 0), plus the display height.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GridOrigin {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Point-in-time copy of the coverage grid, ready for publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSnapshot {
    /// Reference frame the grid is expressed in, e.g. `"minefield"`.
    pub frame_id: String,
    pub stamp: DateTime<Utc>,
    /// Meters per cell edge.
    pub resolution: f64,
    pub width: u32,
    pub height: u32,
    pub origin: GridOrigin,
    /// Row-major occupancy values, `width * height` entries.
    pub data: Vec<i8>,
}

impl GridSnapshot {
    /// Number of cells carrying the covered occupancy value.
    pub fn covered_cells(&self) -> usize {
        self.data
            .iter()
            .filter(|&&v| v == CellState::COVERED_VALUE)
            .count()
    }

    /// Occupancy value at cell `(x, y)`, or `None` when out of bounds.
    pub fn value_at(&self, x: u32, y: u32) -> Option<i8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get((y * self.width + x) as usize).copied()
    }
}

/// Unified event wrapper for the publication bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "coilsweep-runtime::coverage_loop"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` in a freshly stamped event.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// Full grid snapshot, published once per cycle.
    OccupancyGrid(GridSnapshot),
    /// Covered cells divided by total cells, in `[0, 1]`.
    CoverageRate(f32),
    /// Startup gating handshake ("configuration done").
    StartSignal(bool),
    /// One parent→child edge of the transform tree, planar rotation only.
    Transform {
        parent: String,
        child: String,
        /// `[x, y, z]` offset of `child` in `parent`, meters.
        translation: [f64; 3],
        /// Rotation about Z, radians.
        yaw: f64,
    },
}

/// Error type shared by every coilsweep crate.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum SweepError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Pose unavailable for frame {frame}: {reason}")]
    PoseUnavailable { frame: String, reason: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Start signal not received within {0:?}")]
    StartTimeout(Duration),

    #[error("Bridge error: {0}")]
    Bridge(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_state_defaults_to_unscanned() {
        assert_eq!(CellState::default(), CellState::Unscanned);
        assert!(!CellState::default().is_covered());
    }

    #[test]
    fn cell_state_occupancy_scale() {
        assert_eq!(CellState::Unscanned.occupancy_value(), 50);
        assert_eq!(CellState::Covered.occupancy_value(), 0);
    }

    fn snapshot() -> GridSnapshot {
        GridSnapshot {
            frame_id: "minefield".to_string(),
            stamp: Utc::now(),
            resolution: 0.5,
            width: 3,
            height: 2,
            origin: GridOrigin {
                x: -0.75,
                y: -0.5,
                z: -0.3,
            },
            data: vec![50, 0, 50, 0, 0, 50],
        }
    }

    #[test]
    fn snapshot_counts_covered_cells() {
        assert_eq!(snapshot().covered_cells(), 3);
    }

    #[test]
    fn snapshot_value_at_is_row_major() {
        let s = snapshot();
        assert_eq!(s.value_at(1, 0), Some(0));
        assert_eq!(s.value_at(0, 1), Some(0));
        assert_eq!(s.value_at(2, 1), Some(50));
        assert_eq!(s.value_at(3, 0), None);
        assert_eq!(s.value_at(0, 2), None);
    }

    #[test]
    fn event_roundtrip() {
        let event = Event::new("coilsweep-runtime::test", EventPayload::OccupancyGrid(snapshot()));
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, back.id);
        match back.payload {
            EventPayload::OccupancyGrid(grid) => {
                assert_eq!(grid.width, 3);
                assert_eq!(grid.data, vec![50, 0, 50, 0, 0, 50]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn transform_payload_serialises_with_field_names() {
        let event = Event::new(
            "coilsweep-middleware::bridge/tf",
            EventPayload::Transform {
                parent: "minefield".to_string(),
                child: "left_coil".to_string(),
                translation: [1.0, -2.0, 0.3],
                yaw: 0.5,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"Transform\""));
        assert!(json.contains("\"child\":\"left_coil\""));
    }

    #[test]
    fn sweep_error_display() {
        let err = SweepError::Config("width must be positive".to_string());
        assert!(err.to_string().contains("width must be positive"));

        let err2 = SweepError::PoseUnavailable {
            frame: "left_coil".to_string(),
            reason: "frame not yet broadcast".to_string(),
        };
        assert!(err2.to_string().contains("left_coil"));
    }
}
