//! `coilsweep-middleware` – carries coverage output to whoever listens.
//!
//! # Modules
//!
//! - [`bus`] – topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.  The coverage loop publishes grid snapshots and the
//!   coverage rate on it; the startup handshake and external transforms
//!   arrive on it.
//! - [`bridge`] – WebSocket bridge: ingests `/tf` edges from external
//!   broadcasters and streams coverage output to connected clients.

pub mod bridge;
pub mod bus;

pub use bridge::Bridge;
pub use bus::{EventBus, Topic, TopicReceiver};
