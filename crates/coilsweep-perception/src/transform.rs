//! Transform Frame (TF) Engine.
//!
//! Maintains a directed graph of named reference frames and the stamped 3-D
//! rigid-body transforms (translation + quaternion rotation) that relate
//! them.  Broadcasters (the vehicle simulator, an external bridge) keep the
//! edges current; the pose sampler asks for the composed transform from the
//! field frame to each coil frame.
//!
//! Every edge remembers when it was last set.  [`TfEngine::lookup_fresh`]
//! refuses to answer with a chain that contains an edge older than the
//! allowed age, which is how a coil whose broadcaster went quiet turns into a
//! failed lookup instead of a frozen position.
//!
//! # Example
//!
//! ```rust
//! use coilsweep_perception::transform::{TfEngine, Transform3D, Vec3, Quaternion};
//!
//! let mut tf = TfEngine::new();
//!
//! // base_link is 1 m forward of the field origin, same orientation.
//! tf.set_transform("minefield", "base_link",
//!     Transform3D::new(Vec3::new(1.0, 0.0, 0.0), Quaternion::identity()));
//!
//! // the middle coil is 0.5 m ahead of base_link.
//! tf.set_transform("base_link", "middle_coil",
//!     Transform3D::new(Vec3::new(0.5, 0.0, 0.0), Quaternion::identity()));
//!
//! let t = tf.lookup("minefield", "middle_coil").unwrap();
//! assert!((t.translation.x - 1.5).abs() < 1e-9);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use thiserror::Error;

// ────────────────────────────────────────────────────────────────────────────
// Primitive types
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D translation vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

/// A unit quaternion representing a 3-D rotation (w, x, y, z convention).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    /// Create a quaternion.  The caller is responsible for providing a unit
    /// quaternion (|q| = 1).
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Rotation of `yaw` radians about +Z.  Ground vehicles only ever need
    /// this one.
    pub fn from_yaw(yaw: f64) -> Self {
        let half = yaw * 0.5;
        Self::new(half.cos(), 0.0, 0.0, half.sin())
    }

    /// Hamilton product: compose two rotations.
    pub fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        )
    }

    /// Conjugate (== inverse for a unit quaternion).
    pub fn conjugate(self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    /// Rotate a vector by this quaternion: p' = q * p * q*.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let p = Self::new(0.0, v.x, v.y, v.z);
        let rotated = self.mul(p).mul(self.conjugate());
        Vec3::new(rotated.x, rotated.y, rotated.z)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Transform3D
// ────────────────────────────────────────────────────────────────────────────

/// A rigid-body 3-D transform: translation followed by rotation.
///
/// Represents the pose of frame B relative to frame A: to convert a point
/// expressed in frame B into frame A, rotate it by `rotation` then add
/// `translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform3D {
    pub translation: Vec3,
    pub rotation: Quaternion,
}

impl Transform3D {
    pub fn new(translation: Vec3, rotation: Quaternion) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Vec3::zero(), Quaternion::identity())
    }

    /// Compose two transforms: if `self` = T_A_B and `other` = T_B_C, the
    /// result is T_A_C.
    pub fn compose(self, other: Self) -> Self {
        let translated = self.translation.add(self.rotation.rotate(other.translation));
        let rotated = self.rotation.mul(other.rotation);
        Self::new(translated, rotated)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Why a transform lookup could not be answered.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TfError {
    /// The frame has never been broadcast.
    #[error("frame '{0}' does not exist")]
    UnknownFrame(String),

    /// Both frames exist but are not connected in the parent → child
    /// direction.
    #[error("no transform chain from '{from}' to '{to}'")]
    NoPath { from: String, to: String },

    /// A chain exists, but at least one edge on it is older than allowed.
    #[error("transform '{from}' -> '{to}' is stale ({age:?} old, limit {limit:?})")]
    Stale {
        from: String,
        to: String,
        age: Duration,
        limit: Duration,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// TfEngine
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct StampedEdge {
    transform: Transform3D,
    stamp: Instant,
}

/// A directed graph of named reference frames and the stamped
/// [`Transform3D`]s that relate them.
///
/// Edges are directional: adding `"A" → "B"` does not create the inverse.
/// [`TfEngine::lookup`] performs BFS to find the shortest path from source
/// to target and returns the composed transform.
#[derive(Debug, Default)]
pub struct TfEngine {
    /// `edges[parent][child] = StampedEdge`
    edges: HashMap<String, HashMap<String, StampedEdge>>,
    frames: HashSet<String>,
}

impl TfEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update the transform from `parent_frame` to
    /// `child_frame`, stamped now.
    pub fn set_transform(&mut self, parent_frame: &str, child_frame: &str, transform: Transform3D) {
        self.set_transform_at(parent_frame, child_frame, transform, Instant::now());
    }

    /// Register or update a transform with an explicit stamp.
    pub fn set_transform_at(
        &mut self,
        parent_frame: &str,
        child_frame: &str,
        transform: Transform3D,
        stamp: Instant,
    ) {
        self.frames.insert(parent_frame.to_string());
        self.frames.insert(child_frame.to_string());
        self.edges
            .entry(parent_frame.to_string())
            .or_default()
            .insert(child_frame.to_string(), StampedEdge { transform, stamp });
    }

    /// `true` once `frame` has appeared on either end of any edge.
    pub fn has_frame(&self, frame: &str) -> bool {
        self.frames.contains(frame)
    }

    /// Compute the composed [`Transform3D`] that maps points in
    /// `target_frame` into `source_frame`, regardless of edge age.
    pub fn lookup(&self, source_frame: &str, target_frame: &str) -> Result<Transform3D, TfError> {
        self.resolve(source_frame, target_frame)
            .map(|(transform, _)| transform)
    }

    /// Like [`lookup`][Self::lookup], but fails with [`TfError::Stale`] when
    /// the oldest edge on the chain was set more than `max_age` ago.
    pub fn lookup_fresh(
        &self,
        source_frame: &str,
        target_frame: &str,
        max_age: Duration,
    ) -> Result<Transform3D, TfError> {
        let (transform, oldest) = self.resolve(source_frame, target_frame)?;
        if let Some(stamp) = oldest {
            let age = stamp.elapsed();
            if age > max_age {
                return Err(TfError::Stale {
                    from: source_frame.to_string(),
                    to: target_frame.to_string(),
                    age,
                    limit: max_age,
                });
            }
        }
        Ok(transform)
    }

    /// BFS over the directed graph.  Each queue item carries the transform
    /// composed so far and the oldest stamp seen along the way.
    fn resolve(
        &self,
        source_frame: &str,
        target_frame: &str,
    ) -> Result<(Transform3D, Option<Instant>), TfError> {
        for frame in [source_frame, target_frame] {
            if !self.has_frame(frame) {
                return Err(TfError::UnknownFrame(frame.to_string()));
            }
        }
        if source_frame == target_frame {
            return Ok((Transform3D::identity(), None));
        }

        let mut queue: VecDeque<(&str, Transform3D, Option<Instant>)> = VecDeque::new();
        let mut visited: HashSet<&str> = HashSet::new();

        queue.push_back((source_frame, Transform3D::identity(), None));
        visited.insert(source_frame);

        while let Some((current, accumulated, oldest)) = queue.pop_front() {
            let Some(children) = self.edges.get(current) else {
                continue;
            };
            for (next, edge) in children {
                if !visited.insert(next.as_str()) {
                    continue;
                }
                let composed = accumulated.compose(edge.transform);
                let oldest = Some(oldest.map_or(edge.stamp, |o: Instant| o.min(edge.stamp)));
                if next == target_frame {
                    return Ok((composed, oldest));
                }
                queue.push_back((next.as_str(), composed, oldest));
            }
        }

        Err(TfError::NoPath {
            from: source_frame.to_string(),
            to: target_frame.to_string(),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
