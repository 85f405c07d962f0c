//! [`StartGate`] – one-shot startup handshake.
//!
//! In simulation the coverage loop must not start before the field has been
//! generated.  The gate is a `watch` channel that flips from closed to open
//! exactly once; the loop awaits it with an optional timeout instead of
//! polling a flag.  Deployments without a handshake use
//! [`StartGate::opened`].
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use coilsweep_runtime::start_gate::start_gate;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (trigger, mut gate) = start_gate();
//! trigger.fire();
//! gate.wait(Some(Duration::from_millis(10))).await.unwrap();
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use coilsweep_middleware::{EventBus, Topic};
use coilsweep_types::{EventPayload, SweepError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Create a connected trigger/gate pair, initially closed.
pub fn start_gate() -> (StartTrigger, StartGate) {
    let (tx, rx) = watch::channel(false);
    (StartTrigger { tx: Arc::new(tx) }, StartGate { rx })
}

/// Opens the paired [`StartGate`].  Cheap to clone.
#[derive(Clone, Debug)]
pub struct StartTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl StartTrigger {
    /// Open the gate.  Firing more than once is harmless.
    pub fn fire(&self) {
        if !self.tx.send_replace(true) {
            info!("start signal received");
        }
    }
}

/// Awaitable side of the startup handshake.
#[derive(Debug)]
pub struct StartGate {
    rx: watch::Receiver<bool>,
}

impl StartGate {
    /// A gate that is already open.
    pub fn opened() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { rx }
    }

    pub fn is_open(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the gate opens.
    ///
    /// `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// * [`SweepError::StartTimeout`] – `timeout` elapsed first.
    /// * [`SweepError::Channel`] – every trigger was dropped without firing.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<(), SweepError> {
        let opened = self.rx.wait_for(|open| *open);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, opened)
                .await
                .map_err(|_| SweepError::StartTimeout(limit))?,
            None => opened.await,
        };
        result
            .map(|_| ())
            .map_err(|_| SweepError::Channel("start trigger dropped before firing".to_string()))
    }
}

/// Fire `trigger` on the first `StartSignal(true)` seen on
/// [`Topic::Control`].
///
/// The subscription is taken before this function returns, so a signal
/// published right after the call is not missed.
pub fn spawn_bus_listener(bus: &EventBus, trigger: StartTrigger) -> JoinHandle<()> {
    let mut rx = bus.subscribe_to(Topic::Control);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match event.payload {
                    EventPayload::StartSignal(true) => {
                        debug!(source = %event.source, "start signal on control topic");
                        trigger.fire();
                        return;
                    }
                    _ => continue,
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged_by = n, "start listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}
