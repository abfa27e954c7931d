//! Framed TCP transport.
//!
//! Frame layout: `[u32 little-endian payload length][payload]`.
//!
//! Each accepted connection gets a reader task feeding the server's event
//! channel and a writer task draining two queues, with handshake packets
//! always written before queued application traffic.

use super::{ConnectionId, ConnectionRegistry, SendTarget, TransportClient, TransportEvent, TransportServer};
use crate::error::{AppResult, DaqError};
use crate::limits::{MAX_PACKET_BYTES, TRANSPORT_EVENT_CAPACITY};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WRITER_QUEUE_DEPTH: usize = 1024;

/// Reads one frame. `Ok(None)` on a clean end of stream between frames.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_PACKET_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {MAX_PACKET_BYTES}"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

/// Writes one frame.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_PACKET_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("packet of {} bytes exceeds limit of {MAX_PACKET_BYTES}", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

enum WriterMsg {
    Packet(Bytes),
    Close,
}

struct ConnectionHandle {
    priority: mpsc::Sender<WriterMsg>,
    normal: mpsc::Sender<WriterMsg>,
}

type Writers = Arc<Mutex<HashMap<ConnectionId, ConnectionHandle>>>;

/// Listening TCP server.
pub struct TcpServer {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<TransportEvent>>,
    writers: Writers,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    /// Binds `host:port` and starts accepting.
    pub async fn bind(addr: &str) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|source| DaqError::Bind {
            address: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr()?;
        info!("Transport listening on tcp://{}", local_addr);

        let registry = Arc::new(ConnectionRegistry::new());
        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let writers: Writers = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            registry.clone(),
            events_tx,
            writers.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            local_addr,
            registry,
            events_rx: tokio::sync::Mutex::new(events_rx),
            writers,
            cancel,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(
        listener: TcpListener,
        registry: Arc<ConnectionRegistry>,
        events: mpsc::Sender<TransportEvent>,
        writers: Writers,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        Self::spawn_connection(stream, peer, &registry, &events, &writers, &cancel);
                    }
                    Err(e) => warn!("Accept error: {}", e),
                }
            }
        }
        debug!("Accept loop stopped");
    }

    fn spawn_connection(
        stream: TcpStream,
        peer: SocketAddr,
        registry: &Arc<ConnectionRegistry>,
        events: &mpsc::Sender<TransportEvent>,
        writers: &Writers,
        parent: &CancellationToken,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", peer, e);
        }
        let id = registry.insert(peer.to_string());
        let (mut reader, writer) = stream.into_split();
        let (priority_tx, priority_rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        let (normal_tx, normal_rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        writers.lock().insert(
            id,
            ConnectionHandle {
                priority: priority_tx,
                normal: normal_tx,
            },
        );
        let cancel = parent.child_token();

        tokio::spawn(Self::writer_loop(id, writer, priority_rx, normal_rx, cancel.clone()));

        let registry = registry.clone();
        let events = events.clone();
        let writers = writers.clone();
        tokio::spawn(async move {
            debug!(conn = %id, "Connection from {}", peer);
            if events.send(TransportEvent::Connect(id)).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = read_frame(&mut reader) => match frame {
                        Ok(Some(packet)) => {
                            if events.send(TransportEvent::Receive(id, packet)).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!(conn = %id, "Peer {} closed the connection", peer);
                            break;
                        }
                        Err(e) => {
                            warn!(conn = %id, "Connection error from {}: {}", peer, e);
                            break;
                        }
                    }
                }
            }
            cancel.cancel();
            writers.lock().remove(&id);
            registry.mark_disconnected(id);
            let _ = events.send(TransportEvent::Disconnect(id)).await;
        });
    }

    async fn writer_loop(
        id: ConnectionId,
        mut writer: OwnedWriteHalf,
        mut priority: mpsc::Receiver<WriterMsg>,
        mut normal: mpsc::Receiver<WriterMsg>,
        cancel: CancellationToken,
    ) {
        loop {
            let msg = tokio::select! {
                biased;
                Some(msg) = priority.recv() => msg,
                _ = cancel.cancelled() => break,
                Some(msg) = normal.recv() => msg,
                else => break,
            };
            match msg {
                WriterMsg::Packet(packet) => {
                    if let Err(e) = write_frame(&mut writer, &packet).await {
                        warn!(conn = %id, "Write failed: {}", e);
                        break;
                    }
                }
                WriterMsg::Close => break,
            }
        }
        let _ = writer.shutdown().await;
        cancel.cancel();
    }
}

#[async_trait]
impl TransportServer for TcpServer {
    fn connection_string(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    async fn send(&self, packet: Bytes, target: SendTarget, during_handshake: bool) -> AppResult<()> {
        let ids = match target {
            SendTarget::One(id) => vec![id],
            SendTarget::All => self.registry.connected_ids(!during_handshake),
        };
        for id in ids {
            if !during_handshake && !self.registry.is_identified(id) {
                debug!(conn = %id, "Skipping send to unidentified connection");
                continue;
            }
            let tx = self.writers.lock().get(&id).map(|handle| {
                if during_handshake {
                    handle.priority.clone()
                } else {
                    handle.normal.clone()
                }
            });
            let result = match tx {
                Some(tx) => tx
                    .send(WriterMsg::Packet(packet.clone()))
                    .await
                    .map_err(|_| DaqError::Connection(format!("connection {id} is closing"))),
                None => Err(DaqError::Connection(format!("connection {id} is not open"))),
            };
            match (target, result) {
                (SendTarget::One(_), Err(e)) => return Err(e),
                (SendTarget::All, Err(e)) => warn!("Broadcast skipped {}: {}", id, e),
                _ => {}
            }
        }
        Ok(())
    }

    async fn process(&self, timeout: Duration) -> Option<TransportEvent> {
        let mut rx = self.events_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    fn close(&self, conn: ConnectionId) {
        if let Some(handle) = self.writers.lock().get(&conn) {
            if handle.priority.try_send(WriterMsg::Close).is_err() {
                warn!(conn = %conn, "Close request could not be queued");
            }
        }
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.writers.lock().clear();
        info!("Transport tcp://{} shut down", self.local_addr);
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Client connection to a TCP server.
pub struct TcpClient {
    remote: String,
    writer: OwnedWriteHalf,
    incoming: mpsc::Receiver<AppResult<Bytes>>,
    reader_task: JoinHandle<()>,
}

impl TcpClient {
    /// Connects to `host:port`.
    pub async fn connect(addr: &str) -> AppResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| DaqError::Connection(format!("cannot connect to {addr}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", addr, e);
        }
        let (mut reader, writer) = stream.into_split();
        let (tx, incoming) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let remote = addr.to_string();
        let peer = remote.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                let item = match read_frame(&mut reader).await {
                    Ok(Some(packet)) => Ok(packet),
                    Ok(None) => Err(DaqError::Connection(format!("{peer} closed the connection"))),
                    Err(e) => Err(DaqError::Connection(format!("read from {peer} failed: {e}"))),
                };
                let done = item.is_err();
                if tx.send(item).await.is_err() || done {
                    break;
                }
            }
        });
        Ok(Self {
            remote,
            writer,
            incoming,
            reader_task,
        })
    }
}

#[async_trait]
impl TransportClient for TcpClient {
    async fn send(&mut self, packet: &[u8]) -> AppResult<()> {
        write_frame(&mut self.writer, packet)
            .await
            .map_err(|e| DaqError::Connection(format!("write to {} failed: {e}", self.remote)))
    }

    async fn receive(&mut self, timeout: Duration) -> AppResult<Option<Bytes>> {
        match tokio::time::timeout(timeout, self.incoming.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(item)) => item.map(Some),
            Ok(None) => Err(DaqError::Connection(format!("{} is disconnected", self.remote))),
        }
    }

    fn remote(&self) -> String {
        format!("tcp://{}", self.remote)
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"hello").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), Bytes::new());
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_server_client_exchange() {
        let server = TcpServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();
        let mut client = TcpClient::connect(&addr).await.unwrap();

        let conn = match server.process(Duration::from_secs(2)).await {
            Some(TransportEvent::Connect(id)) => id,
            other => panic!("expected connect, got {other:?}"),
        };

        // Unidentified: normal sends are skipped, handshake sends go out.
        server
            .send(Bytes::from_static(b"skipped"), SendTarget::One(conn), false)
            .await
            .unwrap();
        server
            .send(Bytes::from_static(b"greeting"), SendTarget::One(conn), true)
            .await
            .unwrap();
        let got = client.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(got.unwrap(), Bytes::from_static(b"greeting"));

        client.send(b"reply").await.unwrap();
        match server.process(Duration::from_secs(2)).await {
            Some(TransportEvent::Receive(id, packet)) => {
                assert_eq!(id, conn);
                assert_eq!(packet, Bytes::from_static(b"reply"));
            }
            other => panic!("expected receive, got {other:?}"),
        }

        drop(client);
        match server.process(Duration::from_secs(2)).await {
            Some(TransportEvent::Disconnect(id)) => assert_eq!(id, conn),
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert!(!server.registry().get(conn).unwrap().connected);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = TcpClient::connect(&addr).await.err().unwrap();
        assert!(matches!(err, DaqError::Connection(_)));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let server = TcpServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();
        let err = TcpServer::bind(&addr).await.err().unwrap();
        assert!(matches!(err, DaqError::Bind { .. }));
    }
}
