//! Built-in vehicle simulator for running coilsweep without a robot.
//!
//! [`VehicleSim`] drives a boustrophedon ("lawn-mower") pattern across the
//! field and broadcasts the vehicle pose plus the coil mounting offsets into
//! the shared [`TfEngine`], exactly where an external transform bridge would
//! write them.  Once its field is laid out it publishes the start handshake
//! on the bus.

use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use coilsweep_middleware::{EventBus, Topic};
use coilsweep_perception::{Quaternion, TfEngine, Transform3D, Vec3};
use coilsweep_types::{Event, EventPayload};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BASE_FRAME: &str = "base_link";
/// Lateral spacing between adjacent coils.
const COIL_SPACING: f64 = 0.5;
/// Coils ride this far ahead of the vehicle centre.
const COIL_FORWARD_OFFSET: f64 = 0.5;
/// Coil height above the ground.
const COIL_HEIGHT: f64 = 0.3;
/// Vehicle cruise speed in m/s.
const DEFAULT_SPEED: f64 = 0.6;
const MIN_STEP: Duration = Duration::from_millis(1);
const MAX_STEP: Duration = Duration::from_secs(1);

/// Kinematic stand-in for the demining vehicle.
pub struct VehicleSim {
    tf: Arc<RwLock<TfEngine>>,
    reference_frame: String,
    /// (frame, lateral offset) per coil, left coil first.
    coils: Vec<(String, f64)>,
    half_x: f64,
    half_y: f64,
    lane_spacing: f64,
    speed: f64,
    x: f64,
    y: f64,
    /// +1 while driving towards +X, -1 towards -X.
    direction: f64,
}

impl VehicleSim {
    /// Lay out a sweep over a `field_x × field_y` meter field centred on the
    /// reference frame origin.
    pub fn new(
        tf: Arc<RwLock<TfEngine>>,
        reference_frame: impl Into<String>,
        coil_frames: &[String],
        field_x: f64,
        field_y: f64,
    ) -> Self {
        let n = coil_frames.len();
        let span = (n.saturating_sub(1)) as f64 * COIL_SPACING;
        let coils = coil_frames
            .iter()
            .enumerate()
            .map(|(i, frame)| (frame.clone(), span / 2.0 - i as f64 * COIL_SPACING))
            .collect();
        let half_x = field_x / 2.0;
        let half_y = field_y / 2.0;
        let lane_spacing = (n.max(1) as f64 * COIL_SPACING).max(COIL_SPACING);
        Self {
            tf,
            reference_frame: reference_frame.into(),
            coils,
            half_x,
            half_y,
            lane_spacing,
            speed: DEFAULT_SPEED,
            x: -half_x,
            y: -half_y + lane_spacing / 2.0,
            direction: 1.0,
        }
    }

    #[cfg(test)]
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Current vehicle position.
    pub fn position(&self) -> (f64, f64) {
        (self.x, self.y)
    }

    fn heading(&self) -> f64 {
        if self.direction > 0.0 { 0.0 } else { PI }
    }

    /// Advance `dt` seconds and broadcast the new transforms.
    pub fn step(&mut self, dt: f64) {
        self.x += self.direction * self.speed * dt;
        if self.x.abs() >= self.half_x {
            self.x = self.x.clamp(-self.half_x, self.half_x);
            self.direction = -self.direction;
            self.y += self.lane_spacing;
            if self.y > self.half_y {
                debug!("sweep finished; restarting from the first lane");
                self.y = -self.half_y + self.lane_spacing / 2.0;
            }
        }
        self.broadcast();
    }

    /// Write the vehicle pose and every coil mount into the transform tree.
    pub fn broadcast(&self) {
        let Ok(mut tf) = self.tf.write() else {
            warn!("transform tree lock poisoned; simulator cannot broadcast");
            return;
        };
        tf.set_transform(
            &self.reference_frame,
            BASE_FRAME,
            Transform3D::new(
                Vec3::new(self.x, self.y, 0.0),
                Quaternion::from_yaw(self.heading()),
            ),
        );
        for (frame, lateral) in &self.coils {
            tf.set_transform(
                BASE_FRAME,
                frame,
                Transform3D::new(
                    Vec3::new(COIL_FORWARD_OFFSET, *lateral, COIL_HEIGHT),
                    Quaternion::identity(),
                ),
            );
        }
    }

    /// Announce readiness on the bus, then step at `rate_hz` until
    /// `shutdown` is set.
    pub fn spawn(mut self, bus: EventBus, shutdown: Arc<AtomicBool>, rate_hz: f64) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.broadcast();
            let (x, y) = self.position();
            info!(lanes = self.lane_count(), x, y, "simulated field ready");
            if let Err(e) = bus.publish_to(
                Topic::Control,
                Event::new("coilsweep-cli::sim", EventPayload::StartSignal(true)),
            ) {
                warn!(error = %e, "nobody listening for the start signal");
            }

            let period = step_period(rate_hz);
            let dt = period.as_secs_f64();
            let mut interval = tokio::time::interval(period);
            while !shutdown.load(Ordering::Acquire) {
                interval.tick().await;
                self.step(dt);
            }
        })
    }

    fn lane_count(&self) -> usize {
        ((2.0 * self.half_y) / self.lane_spacing).ceil() as usize
    }
}

/// Step period for `rate_hz`, kept between [`MIN_STEP`] and one second.
fn step_period(rate_hz: f64) -> Duration {
    Duration::try_from_secs_f64(1.0 / rate_hz)
        .unwrap_or(MAX_STEP)
        .clamp(MIN_STEP, MAX_STEP)
}
