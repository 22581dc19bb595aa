//! The observing side of the event bus.
//!
//! A client connects to the daemon's socket and decodes the stream of
//! newline-delimited JSON events into a bounded in-memory queue. If the
//! consumer falls behind, new events are dropped with a warning; the bus has
//! no backpressure by design.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{expand_socket_path, BusError, Event};

/// Capacity of the client-side event queue.
const EVENT_BUFFER: usize = 100;

/// A connected observer of the event stream.
pub struct BusClient {
    events: mpsc::Receiver<Event>,
}

impl BusClient {
    /// Connects to the bus socket and starts decoding events. `~/` in the
    /// path is expanded.
    pub async fn connect(socket_path: &str) -> Result<BusClient, BusError> {
        let socket_path = expand_socket_path(socket_path);
        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|source| BusError::Socket {
                path: socket_path.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(read_events(stream, tx));

        Ok(BusClient { events: rx })
    }

    /// Receives the next event. Returns `None` once the server has closed
    /// the connection and all buffered events are drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }
}

/// Decodes newline-delimited JSON events until EOF.
async fn read_events(stream: UnixStream, tx: mpsc::Sender<Event>) {
    let mut lines = BufReader::new(stream).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let event: Event = match serde_json::from_str(&line) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "failed to decode event");
                        continue;
                    }
                };

                match tx.try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(event)) => {
                        warn!(
                            event = event.payload.type_name(),
                            "event queue full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "event stream read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{EventBus, EventPayload};
    use super::*;
    use crate::test_utils::make_ticket;
    use crate::types::WorkerId;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn recv_timeout(client: &mut BusClient) -> Event {
        tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .expect("timed out waiting for event")
            .expect("stream closed")
    }

    #[tokio::test]
    async fn connect_to_missing_socket_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope.sock").to_string_lossy().to_string();
        assert!(BusClient::connect(&path).await.is_err());
    }

    #[tokio::test]
    async fn single_subscriber_receives_events_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus.sock").to_string_lossy().to_string();
        let bus = EventBus::bind(&path).await.unwrap();

        let mut client = BusClient::connect(&path).await.unwrap();
        wait_for_subscribers(&bus, 1).await;

        bus.publish_ticket_enqueued(make_ticket("feat-1", 1)).await;
        bus.publish_ticket_started(make_ticket("feat-1", 1), WorkerId(1))
            .await;

        let first = recv_timeout(&mut client).await;
        assert_eq!(first.payload.type_name(), "ticket_enqueued");
        let second = recv_timeout(&mut client).await;
        assert_eq!(second.payload.type_name(), "ticket_started");

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn two_subscribers_both_receive_fanout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus.sock").to_string_lossy().to_string();
        let bus = EventBus::bind(&path).await.unwrap();

        let mut a = BusClient::connect(&path).await.unwrap();
        let mut b = BusClient::connect(&path).await.unwrap();
        wait_for_subscribers(&bus, 2).await;

        bus.publish_ticket_enqueued(make_ticket("feat-7", 2)).await;

        for client in [&mut a, &mut b] {
            let event = recv_timeout(client).await;
            assert_eq!(event.payload.type_name(), "ticket_enqueued");
            match event.payload {
                EventPayload::TicketEnqueued { ticket, .. } => {
                    assert_eq!(ticket.id.as_str(), "feat-7");
                }
                other => panic!("unexpected payload: {other:?}"),
            }
        }

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn disconnected_subscriber_is_evicted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus.sock").to_string_lossy().to_string();
        let bus = EventBus::bind(&path).await.unwrap();

        let client = BusClient::connect(&path).await.unwrap();
        wait_for_subscribers(&bus, 1).await;
        drop(client);

        // The disconnect watcher notices EOF and removes the subscriber;
        // publishing remains harmless either way.
        for _ in 0..50 {
            bus.publish_queue_updated(0, None).await;
            if bus.subscriber_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(bus.subscriber_count().await, 0);

        bus.shutdown().await;
    }

    async fn wait_for_subscribers(bus: &EventBus, n: usize) {
        for _ in 0..200 {
            if bus.subscriber_count().await >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subscribers never connected");
    }
}
