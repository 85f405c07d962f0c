//! [`CoverageGrid`] – which cells of the field the coils have swept.
//!
//! The grid is centred on the world origin: cell (0, 0) sits at
//! `(-width/2 * resolution, -height/2 * resolution)`.  A coil position is
//! mapped to a cell with
//!
//! ```text
//! cell_x = round(world_x / resolution + width / 2)
//! cell_y = round(world_y / resolution + height / 2)
//! ```
//!
//! where `round` is half-away-from-zero ([`f64::round`]).  Around that cell a
//! circular footprint of [`DetectionFootprint::cell_radius`] cells is marked
//! covered.  The candidate offsets span the half-open square
//! `[-r, r) × [-r, r)` and are filtered by `dx² + dy² <= r²`, so the row and
//! column at `+r` are never stamped while those at `-r` are.
//!
//! # Example
//!
//! ```rust
//! use coilsweep_perception::coverage::CoverageGrid;
//!
//! let mut grid = CoverageGrid::new(1.0, 10, 10).unwrap();
//! assert_eq!(grid.coverage_ratio(), 0.0);
//!
//! let added = grid.mark_covered(0.0, 0.0, 1);
//! assert_eq!(added, 3);
//! assert_eq!(grid.covered_count(), 3);
//! ```

use chrono::{DateTime, Utc};
use coilsweep_types::{CellState, GridOrigin, GridSnapshot, SweepError};
use tracing::warn;

// ────────────────────────────────────────────────────────────────────────────
// DetectionFootprint
// ────────────────────────────────────────────────────────────────────────────

/// Detection radius of every coil, expressed in whole cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionFootprint {
    cell_radius: i64,
}

impl DetectionFootprint {
    /// Derive the footprint from the detection distance (meters) and the
    /// grid resolution (meters per cell).  The quotient is truncated toward
    /// zero.
    ///
    /// # Errors
    ///
    /// [`SweepError::Config`] when the resolution is not a positive finite
    /// number or the distance is negative or not finite.
    pub fn new(detection_min_dist: f64, resolution: f64) -> Result<Self, SweepError> {
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(SweepError::Config(format!(
                "resolution must be positive, got {resolution}"
            )));
        }
        if !(detection_min_dist.is_finite() && detection_min_dist >= 0.0) {
            return Err(SweepError::Config(format!(
                "detection distance must be non-negative, got {detection_min_dist}"
            )));
        }
        Ok(Self {
            cell_radius: (detection_min_dist / resolution) as i64,
        })
    }

    pub fn from_cells(cell_radius: i64) -> Self {
        Self { cell_radius }
    }

    pub fn cell_radius(&self) -> i64 {
        self.cell_radius
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CoverageGrid
// ────────────────────────────────────────────────────────────────────────────

/// Fixed-shape 2-D array of [`CellState`]s plus a running covered count.
///
/// `covered_count` always equals the number of cells in
/// [`CellState::Covered`] and never decreases.
#[derive(Debug, Clone)]
pub struct CoverageGrid {
    resolution: f64,
    width: u32,
    height: u32,
    origin: GridOrigin,
    /// Row-major, `width * height` entries.
    cells: Vec<CellState>,
    covered_count: usize,
}

impl CoverageGrid {
    /// Allocate a `width × height` grid with every cell unscanned.
    ///
    /// # Errors
    ///
    /// [`SweepError::Config`] when a dimension is not positive (or does not
    /// fit a `u32`) or the resolution is not a positive finite number.
    pub fn new(resolution: f64, width: i64, height: i64) -> Result<Self, SweepError> {
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(SweepError::Config(format!(
                "resolution must be positive, got {resolution}"
            )));
        }
        let width = positive_dimension("width", width)?;
        let height = positive_dimension("height", height)?;

        let origin = GridOrigin {
            x: -f64::from(width) / 2.0 * resolution,
            y: -f64::from(height) / 2.0 * resolution,
            z: 0.0,
        };

        Ok(Self {
            resolution,
            width,
            height,
            origin,
            cells: vec![CellState::Unscanned; width as usize * height as usize],
            covered_count: 0,
        })
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// World coordinates of cell (0, 0).  `z` is always zero here; the
    /// display height is chosen per snapshot.
    pub fn origin(&self) -> GridOrigin {
        self.origin
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn covered_count(&self) -> usize {
        self.covered_count
    }

    /// State of cell `(x, y)`, or `None` outside the grid.
    pub fn cell(&self, x: i64, y: i64) -> Option<CellState> {
        self.index(x, y).map(|i| self.cells[i])
    }

    /// Map a world position to (possibly out-of-range) cell coordinates.
    pub fn world_to_cell(&self, world_x: f64, world_y: f64) -> (i64, i64) {
        let cx = (world_x / self.resolution + f64::from(self.width) / 2.0).round();
        let cy = (world_y / self.resolution + f64::from(self.height) / 2.0).round();
        (cx as i64, cy as i64)
    }

    /// Mark every in-bounds cell of the footprint centred on
    /// `(world_x, world_y)` as covered.
    ///
    /// Offsets outside the grid are clipped silently.  Cells that are already
    /// covered are left alone, so repeated or overlapping stamps never count
    /// a cell twice.  Returns how many cells changed state.
    pub fn mark_covered(&mut self, world_x: f64, world_y: f64, cell_radius: i64) -> usize {
        if !(world_x.is_finite() && world_y.is_finite()) {
            warn!(world_x, world_y, "ignoring non-finite coil position");
            return 0;
        }

        let r = cell_radius;
        let r_sq = i128::from(r) * i128::from(r);
        let (cx, cy) = self.world_to_cell(world_x, world_y);

        // Intersect [-r, r) with the offsets that stay inside [0, width).
        let dx_range = r.saturating_neg().max(cx.saturating_neg())
            ..r.min(i64::from(self.width).saturating_sub(cx));
        let dy_range = r.saturating_neg().max(cy.saturating_neg())
            ..r.min(i64::from(self.height).saturating_sub(cy));

        let mut newly_covered = 0;
        for dx in dx_range {
            for dy in dy_range.clone() {
                if i128::from(dx) * i128::from(dx) + i128::from(dy) * i128::from(dy) > r_sq {
                    continue;
                }
                let Some(i) = self.index(cx + dx, cy + dy) else {
                    continue;
                };
                if self.cells[i] == CellState::Unscanned {
                    self.cells[i] = CellState::Covered;
                    self.covered_count += 1;
                    newly_covered += 1;
                }
            }
        }

        debug_assert_eq!(self.covered_count, self.recount_covered());
        newly_covered
    }

    /// `covered_count / (width * height)`, in `[0, 1]`.
    pub fn coverage_ratio(&self) -> f64 {
        self.covered_count as f64 / self.cells.len() as f64
    }

    /// Count covered cells by scanning the array.  Always equal to
    /// [`covered_count`][Self::covered_count].
    pub fn recount_covered(&self) -> usize {
        self.cells.iter().filter(|c| c.is_covered()).count()
    }

    /// Copy the grid into a publishable [`GridSnapshot`].
    pub fn snapshot(&self, frame_id: &str, stamp: DateTime<Utc>, origin_z: f64) -> GridSnapshot {
        GridSnapshot {
            frame_id: frame_id.to_string(),
            stamp,
            resolution: self.resolution,
            width: self.width,
            height: self.height,
            origin: GridOrigin {
                z: origin_z,
                ..self.origin
            },
            data: self.cells.iter().map(|c| c.occupancy_value()).collect(),
        }
    }

    fn index(&self, x: i64, y: i64) -> Option<usize> {
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return None;
        }
        Some(y as usize * self.width as usize + x as usize)
    }
}

fn positive_dimension(name: &str, value: i64) -> Result<u32, SweepError> {
    if value <= 0 {
        return Err(SweepError::Config(format!(
            "{name} must be positive, got {value}"
        )));
    }
    u32::try_from(value)
        .map_err(|_| SweepError::Config(format!("{name} is too large: {value}")))
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
