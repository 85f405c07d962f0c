//! WebSocket bridge between coilsweep and the robot software around it.
//!
//! [`Bridge`]:
//!
//! 1. **Ingests** transform edges (`/tf`-style messages) from external
//!    broadcasters and publishes them on [`Topic::Transforms`], where the
//!    runtime's transform listener feeds them into the shared transform tree.
//!
//! 2. **Serves** the coverage output: every connected client receives each
//!    grid snapshot and coverage rate as one JSON-encoded [`Event`] per text
//!    frame.
//!
//! Incoming frames use the rosbridge publish envelope:
//!
//! ```text
//! {"op":"publish","topic":"/tf",
//!  "msg":{"parent":"minefield","child":"left_coil","translation":[1.0,2.0,0.3],"yaw":0.0}}
//! ```
//!
//! Anything else is ignored.

use std::net::SocketAddr;

use coilsweep_types::{Event, EventPayload, SweepError};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Topic};

/// Topic name external broadcasters publish transform edges on.
pub const TF_TOPIC: &str = "/tf";

const TF_SOURCE: &str = "coilsweep-middleware::bridge/tf";

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

#[derive(Debug, Deserialize)]
struct TransformMsg {
    parent: String,
    child: String,
    translation: [f64; 3],
    #[serde(default)]
    yaw: f64,
}

/// Bridge between external clients and the internal [`EventBus`].
#[derive(Clone, Debug)]
pub struct Bridge {
    bus: EventBus,
}

impl Bridge {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Publish one transform edge as an [`EventPayload::Transform`] event.
    ///
    /// # Errors
    ///
    /// [`SweepError::Channel`] when nothing listens on
    /// [`Topic::Transforms`].
    pub fn ingest_transform(
        &self,
        parent: impl Into<String>,
        child: impl Into<String>,
        translation: [f64; 3],
        yaw: f64,
    ) -> Result<usize, SweepError> {
        self.bus.publish_to(
            Topic::Transforms,
            Event::new(
                TF_SOURCE,
                EventPayload::Transform {
                    parent: parent.into(),
                    child: child.into(),
                    translation,
                    yaw,
                },
            ),
        )
    }

    /// Bind the WebSocket listener.
    ///
    /// # Errors
    ///
    /// [`SweepError::Bridge`] if the address cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, SweepError> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| SweepError::Bridge(format!("ws bind error on {addr}: {e}")))
    }

    /// Accept clients on `listener` until the task is dropped.
    pub async fn serve(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "bridge listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let bridge = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = bridge.handle_ws_client(stream, peer).await {
                            error!(peer = %peer, error = %e, "ws client error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "ws accept error"),
            }
        }
    }

    async fn handle_ws_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), SweepError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| SweepError::Bridge(format!("ws handshake from {peer}: {e}")))?;
        debug!(peer = %peer, "ws client connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut grids = self.bus.subscribe_to(Topic::OccupancyGrid);
        let mut rates = self.bus.subscribe_to(Topic::CoverageRate);

        loop {
            let open = tokio::select! {
                result = grids.recv() => forward(&mut ws_tx, peer, result).await?,
                result = rates.recv() => forward(&mut ws_tx, peer, result).await?,
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => false,
                    Some(Ok(Message::Text(text))) => {
                        self.handle_incoming_ws_message(text.as_str());
                        true
                    }
                    Some(Ok(_)) => true,
                },
            };
            if !open {
                break;
            }
        }

        debug!(peer = %peer, "ws client disconnected");
        Ok(())
    }

    /// Parse one incoming text frame.  Returns `true` when it carried a
    /// transform edge that was published on the bus.
    fn handle_incoming_ws_message(&self, text: &str) -> bool {
        let Ok(json) = serde_json::from_str::<serde_json::Value>(text) else {
            return false;
        };
        if json.get("topic").and_then(|t| t.as_str()) != Some(TF_TOPIC) {
            return false;
        }
        let Some(msg) = json.get("msg") else {
            return false;
        };
        let edge = match TransformMsg::deserialize(msg) {
            Ok(edge) => edge,
            Err(e) => {
                warn!(error = %e, "malformed transform message");
                return false;
            }
        };
        match self.ingest_transform(edge.parent, edge.child, edge.translation, edge.yaw) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "transform dropped");
                false
            }
        }
    }
}

/// Send one bus event to the client.  `Ok(false)` once the client or the
/// bus has gone away.
async fn forward(
    ws_tx: &mut WsSink,
    peer: SocketAddr,
    result: Result<Event, broadcast::error::RecvError>,
) -> Result<bool, SweepError> {
    match result {
        Ok(event) => {
            let json =
                serde_json::to_string(&event).map_err(|e| SweepError::Bridge(e.to_string()))?;
            Ok(ws_tx.send(Message::Text(json.into())).await.is_ok())
        }
        Err(broadcast::error::RecvError::Lagged(n)) => {
            warn!(peer = %peer, lagged_by = n, "ws client lagged");
            Ok(true)
        }
        Err(broadcast::error::RecvError::Closed) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tf_frame(child: &str, x: f64) -> String {
        format!(
            r#"{{"op":"publish","topic":"/tf","msg":{{"parent":"minefield","child":"{child}","translation":[{x},2.0,0.3],"yaw":0.25}}}}"#
        )
    }

    #[tokio::test]
    async fn ingest_transform_publishes_on_transforms_topic() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Transforms);
        let bridge = Bridge::new(bus);

        bridge.ingest_transform("minefield", "left_coil", [1.0, 2.0, 0.3], 0.5).unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, TF_SOURCE);
        match event.payload {
            EventPayload::Transform { parent, child, translation, yaw } => {
                assert_eq!(parent, "minefield");
                assert_eq!(child, "left_coil");
                assert_eq!(translation, [1.0, 2.0, 0.3]);
                assert_eq!(yaw, 0.5);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn handle_incoming_tf_message_publishes_transform() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Transforms);
        let bridge = Bridge::new(bus);

        assert!(bridge.handle_incoming_ws_message(&tf_frame("middle_coil", 1.5)));

        match rx.recv().await.unwrap().payload {
            EventPayload::Transform { child, translation, yaw, .. } => {
                assert_eq!(child, "middle_coil");
                assert_eq!(translation, [1.5, 2.0, 0.3]);
                assert_eq!(yaw, 0.25);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn handle_incoming_other_messages_are_ignored() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Transforms);
        let bridge = Bridge::new(bus);

        assert!(!bridge.handle_incoming_ws_message("not json"));
        assert!(!bridge.handle_incoming_ws_message(r#"{"op":"subscribe","topic":"/unknown"}"#));
        assert!(!bridge.handle_incoming_ws_message(
            r#"{"op":"publish","topic":"/tf","msg":{"parent":"minefield","translation":[0,0,0]}}"#
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn transform_without_listener_is_dropped() {
        let bridge = Bridge::new(EventBus::default());
        assert!(!bridge.handle_incoming_ws_message(&tf_frame("left_coil", 0.0)));
    }

    #[tokio::test]
    async fn ws_client_sends_transforms_and_receives_coverage() {
        let bus = EventBus::default();
        let mut transforms = bus.subscribe_to(Topic::Transforms);
        let listener = Bridge::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(Bridge::new(bus.clone()).serve(listener));

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        client
            .send(Message::Text(tf_frame("right_coil", -1.0).into()))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), transforms.recv())
            .await
            .expect("transform forwarded in time")
            .unwrap();
        assert!(matches!(event.payload, EventPayload::Transform { ref child, .. } if child == "right_coil"));

        // The server subscribed before it read the transform frame.
        bus.publish_to(
            Topic::CoverageRate,
            Event::new("coilsweep-middleware::test", EventPayload::CoverageRate(0.125)),
        )
        .unwrap();

        let text = loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("coverage forwarded in time")
                .expect("stream open")
                .unwrap();
            if let Message::Text(text) = frame {
                break text.as_str().to_owned();
            }
        };
        let received: Event = serde_json::from_str(&text).unwrap();
        assert!(matches!(received.payload, EventPayload::CoverageRate(r) if r == 0.125));

        server.abort();
    }
}
