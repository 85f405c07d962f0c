//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::OccupancyGrid`] | One [`GridSnapshot`][coilsweep_types::GridSnapshot] per cycle |
//! | [`Topic::CoverageRate`] | One coverage ratio per cycle |
//! | [`Topic::Control`] | Startup handshake (`StartSignal`) |
//! | [`Topic::Transforms`] | Externally broadcast transform edges |

use coilsweep_types::{Event, SweepError};
use tokio::sync::broadcast;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 64;

/// Routing lanes of the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Full coverage grid snapshots.
    OccupancyGrid,
    /// Scalar coverage ratio.
    CoverageRate,
    /// Lifecycle signals such as the start handshake.
    Control,
    /// Transform edges coming in from outside the process.
    Transforms,
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    occupancy_grid: broadcast::Sender<Event>,
    coverage_rate: broadcast::Sender<Event>,
    control: broadcast::Sender<Event>,
    transforms: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus; `capacity` applies to every topic independently.
    pub fn new(capacity: usize) -> Self {
        let (occupancy_grid, _) = broadcast::channel(capacity);
        let (coverage_rate, _) = broadcast::channel(capacity);
        let (control, _) = broadcast::channel(capacity);
        let (transforms, _) = broadcast::channel(capacity);
        Self {
            occupancy_grid,
            coverage_rate,
            control,
            transforms,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event.
    ///
    /// # Errors
    ///
    /// [`SweepError::Channel`] when nobody is subscribed to the topic.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, SweepError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| SweepError::Channel(format!("no subscribers for topic {topic:?}")))
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live receivers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::OccupancyGrid => &self.occupancy_grid,
            Topic::CoverageRate => &self.coverage_rate,
            Topic::Control => &self.control,
            Topic::Transforms => &self.transforms,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// * `Err(RecvError::Lagged(n))` – the subscriber fell behind and `n`
    ///   events were dropped.  The caller decides whether to continue.
    /// * `Err(RecvError::Closed)` – every sender is gone.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`][Self::recv].
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coilsweep_types::EventPayload;

    fn rate_event(rate: f32) -> Event {
        Event::new("coilsweep-middleware::test", EventPayload::CoverageRate(rate))
    }

    #[tokio::test]
    async fn topic_multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut sub1 = bus.subscribe_to(Topic::CoverageRate);
        let mut sub2 = bus.subscribe_to(Topic::CoverageRate);

        let event = rate_event(0.25);
        assert_eq!(bus.publish_to(Topic::CoverageRate, event.clone())?, 2);

        assert_eq!(sub1.recv().await?.id, event.id);
        assert_eq!(sub2.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn subscriber_does_not_receive_other_topic_events() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut control = bus.subscribe_to(Topic::Control);
        let _rate = bus.subscribe_to(Topic::CoverageRate);

        bus.publish_to(Topic::CoverageRate, rate_event(0.5))?;

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), control.recv()).await;
        assert!(result.is_err(), "Control subscriber must not see CoverageRate traffic");
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_returns_channel_error() {
        let bus = EventBus::default();
        let result = bus.publish_to(Topic::OccupancyGrid, rate_event(0.0));
        assert!(matches!(result, Err(SweepError::Channel(_))));
    }

    #[test]
    fn subscriber_count_follows_receivers() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(Topic::Control), 0);
        let rx = bus.subscribe_to(Topic::Control);
        assert_eq!(rx.topic(), Topic::Control);
        assert_eq!(bus.subscriber_count(Topic::Control), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(Topic::Control), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_reports_lag() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe_to(Topic::OccupancyGrid);
        for _ in 0..32 {
            let _ = bus.publish_to(Topic::OccupancyGrid, rate_event(0.1));
        }
        let result = slow.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }
}
