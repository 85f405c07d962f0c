//! Feeds transform edges arriving on the bus into the shared [`TfEngine`].
//!
//! External broadcasters reach the bus through the WebSocket
//! [`Bridge`][coilsweep_middleware::Bridge]; this listener is the only writer
//! of the transform tree when the built-in simulator is not running.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use coilsweep_middleware::{EventBus, Topic};
use coilsweep_perception::{Quaternion, TfEngine, Transform3D, Vec3};
use coilsweep_types::EventPayload;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Write every [`EventPayload::Transform`] seen on [`Topic::Transforms`]
/// into `tf`.
///
/// The subscription is taken before this function returns.  The task ends
/// when the bus closes or the transform tree lock is poisoned.
pub fn spawn_transform_listener(bus: &EventBus, tf: Arc<RwLock<TfEngine>>) -> JoinHandle<()> {
    let mut rx = bus.subscribe_to(Topic::Transforms);
    tokio::spawn(async move {
        let mut seen: HashSet<String> = HashSet::new();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let EventPayload::Transform {
                        parent,
                        child,
                        translation,
                        yaw,
                    } = event.payload
                    else {
                        continue;
                    };
                    if !(translation.iter().all(|v| v.is_finite()) && yaw.is_finite()) {
                        warn!(parent = %parent, child = %child, "ignoring non-finite transform");
                        continue;
                    }
                    let Some(()) = apply(&tf, &parent, &child, translation, yaw) else {
                        warn!("transform tree lock poisoned; transform listener stopping");
                        return;
                    };
                    if seen.insert(child.clone()) {
                        info!(parent = %parent, child = %child, "first transform received");
                    } else {
                        debug!(child = %child, "transform updated");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged_by = n, "transform listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

fn apply(
    tf: &RwLock<TfEngine>,
    parent: &str,
    child: &str,
    translation: [f64; 3],
    yaw: f64,
) -> Option<()> {
    let mut engine = tf.write().ok()?;
    let [x, y, z] = translation;
    engine.set_transform(
        parent,
        child,
        Transform3D::new(Vec3::new(x, y, z), Quaternion::from_yaw(yaw)),
    );
    Some(())
}
