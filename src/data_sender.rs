//! Pushes serialized events from a producing role to one DataCollector.
//!
//! Sending is asynchronous: [`DataSender::send_event`] serializes the event
//! and pushes it onto a bounded queue drained by a background task. The
//! queue never blocks the caller; when full it drops the oldest packet and
//! returns an [`OverflowWarning`]. Packets are transmitted in send order.
//!
//! Teardown with [`DataSender::close`] stops intake, lets the worker drain
//! whatever is queued, then joins it.

use crate::error::{AppResult, DaqError};
use crate::event::Event;
use crate::limits;
use crate::protocol::{Channel, ClientHandshake};
use crate::queue::{BoundedQueue, OverflowWarning};
use crate::transport::{self, TransportClient};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Queued client on one channel, shared by the DATA and LOG senders.
pub(crate) struct PacketSender {
    remote: String,
    queue: Arc<BoundedQueue<Bytes>>,
    failed: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl PacketSender {
    /// Connects, runs the handshake and starts the send worker.
    pub(crate) async fn connect(
        channel: Channel,
        address: &str,
        role: &str,
        name: &str,
        capacity: usize,
        queue_name: &'static str,
    ) -> AppResult<Self> {
        let mut client = transport::connect(address).await?;
        ClientHandshake::new(channel, role, name)
            .perform(client.as_mut(), limits::GREETING_TIMEOUT, limits::ACK_TIMEOUT)
            .await?;
        let remote = client.remote();
        info!(channel = %channel, role, name, "Connected to {}", remote);

        let queue = Arc::new(BoundedQueue::new(queue_name, capacity));
        let failed = Arc::new(AtomicBool::new(false));
        let worker = tokio::spawn(Self::drain(client, Arc::clone(&queue), Arc::clone(&failed)));
        Ok(Self {
            remote,
            queue,
            failed,
            worker: Some(worker),
        })
    }

    async fn drain(mut client: Box<dyn TransportClient>, queue: Arc<BoundedQueue<Bytes>>, failed: Arc<AtomicBool>) {
        while let Some(packet) = queue.pop().await {
            if let Err(e) = client.send(&packet).await {
                error!("Sending to {} failed, dropping {} queued packets: {}", client.remote(), queue.len(), e);
                failed.store(true, Ordering::Release);
                queue.close();
                while queue.try_pop().is_some() {}
                return;
            }
        }
        debug!("Send worker for {} finished", client.remote());
    }

    pub(crate) fn push(&self, packet: Bytes) -> AppResult<Option<OverflowWarning>> {
        if self.failed.load(Ordering::Acquire) {
            return Err(DaqError::Connection(format!("connection to {} was lost", self.remote)));
        }
        if self.queue.is_closed() {
            return Err(DaqError::Shutdown);
        }
        Ok(self.queue.push(packet))
    }

    pub(crate) fn remote(&self) -> &str {
        &self.remote
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub(crate) async fn close(&mut self) {
        self.queue.close();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("Send worker for {} ended abnormally: {}", self.remote, e);
            }
        }
    }
}

impl Drop for PacketSender {
    fn drop(&mut self) {
        // The detached worker still drains what is queued.
        self.queue.close();
    }
}

/// DATA-channel client of one DataCollector.
pub struct DataSender {
    inner: PacketSender,
}

impl std::fmt::Debug for DataSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSender")
            .field("remote", &self.inner.remote())
            .field("queued", &self.inner.queued())
            .finish()
    }
}

impl DataSender {
    /// Connects to `address` and identifies as `role`/`name`.
    ///
    /// Connection and handshake failures are returned to the caller.
    pub async fn connect(address: &str, role: &str, name: &str) -> AppResult<Self> {
        Self::with_capacity(address, role, name, limits::SENDER_QUEUE_CAPACITY).await
    }

    /// As [`DataSender::connect`], with an explicit queue capacity.
    pub async fn with_capacity(address: &str, role: &str, name: &str, capacity: usize) -> AppResult<Self> {
        let inner = PacketSender::connect(Channel::Data, address, role, name, capacity, "data-sender").await?;
        Ok(Self { inner })
    }

    /// Serializes `ev` and queues it for transmission.
    ///
    /// Returns the overflow warning when the oldest queued event was dropped
    /// to make room.
    pub fn send_event(&self, ev: &Event) -> AppResult<Option<OverflowWarning>> {
        self.inner.push(ev.to_bytes())
    }

    /// DataCollector address.
    pub fn remote(&self) -> &str {
        self.inner.remote()
    }

    /// Events waiting for transmission.
    pub fn queued(&self) -> usize {
        self.inner.queued()
    }

    /// Events dropped on overflow so far.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped()
    }

    /// Stops intake, drains the queue and joins the worker.
    pub async fn close(mut self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Inbound, ServerHandshake};
    use crate::transport::TransportEvent;
    use std::time::Duration;

    #[tokio::test]
    async fn test_null_sender_accepts_everything() {
        let sender = DataSender::connect("null://", "Producer", "p").await.unwrap();
        assert!(sender.send_event(&Event::bore("Test", 0, 1)).unwrap().is_none());
        sender.close().await;
    }

    #[tokio::test]
    async fn test_events_delivered_in_order_before_close_returns() {
        let server = transport::listen("tcp://127.0.0.1:0").await.unwrap();
        let address = server.connection_string();
        let handshake = ServerHandshake::new(Channel::Data);

        let srv = Arc::clone(&server);
        let collector = tokio::spawn(async move {
            let mut numbers = Vec::new();
            while let Some(event) = srv.process(Duration::from_secs(5)).await {
                match event {
                    TransportEvent::Connect(id) => handshake.on_connect(srv.as_ref(), id, true).await.unwrap(),
                    TransportEvent::Receive(id, packet) => {
                        if let Inbound::Payload(bytes) = handshake.on_receive(srv.as_ref(), id, packet).await.unwrap() {
                            let ev = crate::event::EventRegistry::with_defaults().decode(bytes).unwrap();
                            numbers.push(ev.event_number);
                        }
                    }
                    TransportEvent::Disconnect(_) => break,
                }
            }
            numbers
        });

        let sender = DataSender::connect(&address, "Producer", "p1").await.unwrap();
        sender.send_event(&Event::bore("Test", 0, 1)).unwrap();
        for n in 1..=20 {
            sender.send_event(&Event::raw("Test", 0, 1, n)).unwrap();
        }
        sender.close().await;

        let numbers = collector.await.unwrap();
        assert_eq!(numbers, (0..=20).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_refused_connection_is_returned() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("tcp://{}", listener.local_addr().unwrap());
        drop(listener);
        let err = DataSender::connect(&address, "Producer", "p").await.unwrap_err();
        assert!(matches!(err, DaqError::Connection(_)));
    }
}
