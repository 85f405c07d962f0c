//! `coilsweep-runtime` – runs the coverage tracker.
//!
//! # Modules
//!
//! - [`coverage_loop`] – [`CoverageLoop`][coverage_loop::CoverageLoop]: the
//!   fixed-rate driver that samples every coil, stamps the
//!   [`CoverageGrid`][coilsweep_perception::CoverageGrid] and publishes the
//!   snapshot plus coverage ratio once per cycle.
//! - [`start_gate`] – [`StartGate`][start_gate::StartGate]: one-shot startup
//!   handshake with an optional timeout, fed by the event bus.
//! - [`publisher`] – [`CoveragePublisher`][publisher::CoveragePublisher] and
//!   the bus-backed [`BusPublisher`][publisher::BusPublisher].
//! - [`tf_listener`] – [`spawn_transform_listener`][tf_listener::spawn_transform_listener]:
//!   writes transform edges arriving on the bus into the shared transform
//!   tree.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber with an optional OTLP span exporter.

pub mod coverage_loop;
pub mod publisher;
pub mod start_gate;
pub mod telemetry;
pub mod tf_listener;

pub use coverage_loop::{CoverageLoop, CoverageLoopConfig, CycleReport};
pub use publisher::{BusPublisher, CoveragePublisher};
pub use start_gate::{StartGate, StartTrigger, spawn_bus_listener, start_gate};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use tf_listener::spawn_transform_listener;
