//! Server side of the DATA channel.
//!
//! Accepts any number of producer connections. Each identified connection is
//! given a fresh stream number. Decoded events are pushed, with their
//! stream, onto one shared [`BoundedQueue`] that a consumer task drains
//! independently of the network loop.

use crate::error::{AppResult, DaqError};
use crate::event::{Event, EventRegistry};
use crate::limits;
use crate::protocol::{Channel, Inbound, ServerHandshake};
use crate::queue::BoundedQueue;
use crate::transport::{self, ConnectionId, ConnectionInfo, TransportEvent, TransportServer};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One entry of the receive queue.
#[derive(Debug, Clone)]
pub enum ReceivedItem {
    /// A producer finished the handshake.
    Connected {
        /// Stream assigned to the connection.
        stream: u32,
        /// Identification of the producer.
        info: ConnectionInfo,
    },
    /// One decoded event.
    Event {
        /// Source stream.
        stream: u32,
        /// The event.
        event: Arc<Event>,
    },
    /// An identified producer went away.
    Disconnected {
        /// Stream of the departed connection.
        stream: u32,
    },
}

struct Shared {
    server: Arc<dyn TransportServer>,
    registry: Arc<EventRegistry>,
    queue: Arc<BoundedQueue<ReceivedItem>>,
    streams: RwLock<BTreeMap<ConnectionId, u32>>,
    next_stream: AtomicU32,
}

/// Receives events from many producers.
pub struct DataReceiver {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DataReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataReceiver")
            .field("address", &self.shared.server.connection_string())
            .field("streams", &self.shared.streams.read().len())
            .field("queued", &self.shared.queue.len())
            .finish()
    }
}

impl DataReceiver {
    /// Binds `address` with the default queue capacity.
    pub async fn listen(address: &str, registry: Arc<EventRegistry>) -> AppResult<Self> {
        Self::with_capacity(address, registry, limits::RECEIVER_QUEUE_CAPACITY).await
    }

    /// Binds `address`; the receive queue holds at most `capacity` items.
    pub async fn with_capacity(address: &str, registry: Arc<EventRegistry>, capacity: usize) -> AppResult<Self> {
        let server = transport::listen(address).await?;
        let shared = Arc::new(Shared {
            server,
            registry,
            queue: Arc::new(BoundedQueue::new("data-receiver", capacity)),
            streams: RwLock::new(BTreeMap::new()),
            next_stream: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(network_loop(Arc::clone(&shared), cancel.clone()));
        info!("DataReceiver listening on {}", shared.server.connection_string());
        Ok(Self {
            shared,
            cancel,
            task: Some(task),
        })
    }

    /// Address producers connect to.
    pub fn address(&self) -> String {
        self.shared.server.connection_string()
    }

    /// Shared receive queue.
    pub fn queue(&self) -> Arc<BoundedQueue<ReceivedItem>> {
        Arc::clone(&self.shared.queue)
    }

    /// Identified connections and their streams.
    pub fn streams(&self) -> Vec<(u32, ConnectionInfo)> {
        let registry = self.shared.server.registry();
        self.shared
            .streams
            .read()
            .iter()
            .filter_map(|(conn, stream)| registry.get(*conn).map(|info| (*stream, info)))
            .collect()
    }

    /// Stops the network loop, closes every connection and the queue.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.shared.server.shutdown().await;
        self.shared.queue.close();
    }
}

impl Drop for DataReceiver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn network_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let handshake = ServerHandshake::new(Channel::Data);
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = shared.server.process(limits::PROCESS_TIMEOUT) => event,
        };
        let result = match event {
            None => Ok(()),
            Some(TransportEvent::Connect(conn)) => handshake.on_connect(shared.server.as_ref(), conn, true).await,
            Some(TransportEvent::Receive(conn, packet)) => {
                match handshake.on_receive(shared.server.as_ref(), conn, packet).await {
                    Ok(Inbound::Identified(info)) => {
                        let stream = shared.next_stream.fetch_add(1, Ordering::Relaxed);
                        shared.streams.write().insert(conn, stream);
                        info!(stream, "Data stream from {}", info);
                        enqueue(&shared, ReceivedItem::Connected { stream, info });
                        Ok(())
                    }
                    Ok(Inbound::Payload(payload)) => on_payload(&shared, conn, payload),
                    Err(e) => Err(e),
                }
            }
            Some(TransportEvent::Disconnect(conn)) => {
                let stream = shared.streams.write().remove(&conn);
                if let Some(info) = shared.server.registry().reap(conn) {
                    debug!(conn = %conn, "Data connection closed: {}", info);
                }
                if let Some(stream) = stream {
                    enqueue(&shared, ReceivedItem::Disconnected { stream });
                }
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("DATA channel: {}", e);
        }
    }
    debug!("DataReceiver network loop stopped");
}

fn on_payload(shared: &Shared, conn: ConnectionId, payload: bytes::Bytes) -> AppResult<()> {
    let Some(stream) = shared.streams.read().get(&conn).copied() else {
        return Err(DaqError::Protocol(format!("event from unregistered connection {conn}")));
    };
    match shared.registry.decode(payload) {
        Ok(ev) => {
            enqueue(shared, ReceivedItem::Event { stream, event: Arc::new(ev) });
            Ok(())
        }
        Err(DaqError::UnknownType { type_id }) => {
            warn!(stream, type_id, "Dropping event of unregistered type");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn enqueue(shared: &Shared, item: ReceivedItem) {
    // Overflow is logged by the queue itself.
    let _ = shared.queue.push(item);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_sender::DataSender;
    use std::time::Duration;

    async fn next(queue: &BoundedQueue<ReceivedItem>) -> ReceivedItem {
        tokio::time::timeout(Duration::from_secs(5), queue.pop())
            .await
            .expect("queue item")
            .expect("queue open")
    }

    #[tokio::test]
    async fn test_streams_and_events_are_queued_in_order() {
        let mut receiver = DataReceiver::listen("tcp://127.0.0.1:0", Arc::new(EventRegistry::with_defaults()))
            .await
            .unwrap();
        let queue = receiver.queue();

        let sender = DataSender::connect(&receiver.address(), "Producer", "p0").await.unwrap();
        let stream = match next(&queue).await {
            ReceivedItem::Connected { stream, info } => {
                assert_eq!(info.name, "p0");
                stream
            }
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(receiver.streams().len(), 1);

        sender.send_event(&Event::bore("Test", 0, 3)).unwrap();
        sender.send_event(&Event::raw("Test", 0, 3, 1)).unwrap();
        sender.close().await;

        for expected in 0..2 {
            match next(&queue).await {
                ReceivedItem::Event { stream: s, event } => {
                    assert_eq!(s, stream);
                    assert_eq!(event.event_number, expected);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(matches!(next(&queue).await, ReceivedItem::Disconnected { stream: s } if s == stream));
        receiver.shutdown().await;
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_type_is_dropped() {
        let mut registry = EventRegistry::new();
        registry.register_plain(crate::event::TAG_BASE);
        let mut receiver = DataReceiver::listen("tcp://127.0.0.1:0", Arc::new(registry)).await.unwrap();
        let queue = receiver.queue();

        let sender = DataSender::connect(&receiver.address(), "Producer", "p").await.unwrap();
        sender.send_event(&Event::raw("Test", 0, 1, 1)).unwrap();
        sender.send_event(&Event::new(crate::event::TAG_BASE)).unwrap();
        sender.close().await;

        assert!(matches!(next(&queue).await, ReceivedItem::Connected { .. }));
        match next(&queue).await {
            ReceivedItem::Event { event, .. } => assert_eq!(event.type_id, crate::event::type_id(crate::event::TAG_BASE)),
            other => panic!("unexpected {other:?}"),
        }
        receiver.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let mut receiver = DataReceiver::with_capacity("tcp://127.0.0.1:0", Arc::new(EventRegistry::with_defaults()), 2)
            .await
            .unwrap();
        let queue = receiver.queue();
        let sender = DataSender::connect(&receiver.address(), "Producer", "p").await.unwrap();
        for n in 1..=3 {
            sender.send_event(&Event::raw("Test", 0, 1, n)).unwrap();
        }
        sender.close().await;

        for _ in 0..100 {
            if queue.dropped() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Connected + 3 events + Disconnected through a queue of 2.
        assert_eq!(queue.dropped(), 3);
        assert_eq!(queue.len(), 2);
        receiver.shutdown().await;
    }
}
