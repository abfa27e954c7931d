//! LOG channel: messages forwarded from every role to a central LogCollector.
//!
//! Roles connect a [`LogSender`] when RunControl sends them the `LOG`
//! command. The [`LogCollector`] accepts any number of senders, records each
//! message through `tracing` under the `log_collector` target, keeps a short
//! history and optionally appends every message to a file.

use crate::command_receiver::{CommandContext, CommandHandler};
use crate::data_sender::PacketSender;
use crate::error::{AppResult, DaqError};
use crate::limits;
use crate::protocol::{Channel, Inbound, ServerHandshake};
use crate::queue::OverflowWarning;
use crate::serialize::{Deserializer, Serializer};
use crate::status::{Level, TAG_SERVER};
use crate::transport::{self, TransportEvent, TransportServer};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One forwarded log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogMessage {
    /// Severity.
    pub level: Level,
    /// Message text.
    pub message: String,
    /// `Role.name` of the originating role.
    pub sender: String,
    /// Source file, empty when unknown.
    pub file: String,
    /// Source line, 0 when unknown.
    pub line: u32,
    /// Creation time, microsecond precision.
    pub timestamp: DateTime<Utc>,
    /// Extra key/value data.
    pub tags: BTreeMap<String, String>,
}

impl LogMessage {
    /// Message stamped with the current time.
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            sender: String::new(),
            file: String::new(),
            line: 0,
            timestamp: Utc::now().trunc_subsecs(6),
            tags: BTreeMap::new(),
        }
    }

    /// Records the source location.
    pub fn at(mut self, file: &str, line: u32) -> Self {
        self.file = file.to_string();
        self.line = line;
        self
    }

    /// Sets one tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.tags.insert(key.into(), value.to_string());
        self
    }

    /// Encodes as `level, message, sender, file, line, micros, tags`.
    pub fn encode(&self) -> Bytes {
        let mut ser = Serializer::new();
        ser.put_u32(self.level as u32);
        ser.put_str(&self.message);
        ser.put_str(&self.sender);
        ser.put_str(&self.file);
        ser.put_u32(self.line);
        ser.put_u64(self.timestamp.timestamp_micros() as u64);
        ser.put_map(&self.tags);
        ser.finish()
    }

    /// Decodes one LOG payload.
    pub fn decode(packet: impl Into<Bytes>) -> AppResult<Self> {
        let mut de = Deserializer::new(packet);
        let raw_level = de.get_u32()?;
        let level = Level::from_u32(raw_level)
            .ok_or_else(|| DaqError::Protocol(format!("invalid log level {raw_level}")))?;
        let message = de.get_string()?;
        let sender = de.get_string()?;
        let file = de.get_string()?;
        let line = de.get_u32()?;
        let micros = de.get_u64()?;
        let timestamp = DateTime::from_timestamp_micros(micros as i64)
            .ok_or_else(|| DaqError::Serialization(format!("log timestamp {micros} out of range")))?;
        let tags = de.get_map()?;
        Ok(Self {
            level,
            message,
            sender,
            file,
            line,
            timestamp,
            tags,
        })
    }
}

impl std::fmt::Display for LogMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level,
            self.sender,
            self.message
        )?;
        if !self.file.is_empty() {
            write!(f, " ({}:{})", self.file, self.line)?;
        }
        Ok(())
    }
}

/// LOG-channel client of one LogCollector.
pub struct LogSender {
    inner: PacketSender,
    sender: String,
}

impl std::fmt::Debug for LogSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSender")
            .field("remote", &self.inner.remote())
            .field("sender", &self.sender)
            .finish()
    }
}

impl LogSender {
    /// Connects to the LogCollector at `address`.
    pub async fn connect(address: &str, role: &str, name: &str) -> AppResult<Self> {
        let inner = PacketSender::connect(Channel::Log, address, role, name, limits::LOG_QUEUE_CAPACITY, "log-sender").await?;
        Ok(Self {
            inner,
            sender: format!("{role}.{name}"),
        })
    }

    /// Queues `msg`, filling in the sender when empty.
    pub fn send(&self, mut msg: LogMessage) -> AppResult<Option<OverflowWarning>> {
        if msg.sender.is_empty() {
            msg.sender = self.sender.clone();
        }
        self.inner.push(msg.encode())
    }

    /// LogCollector address.
    pub fn remote(&self) -> &str {
        self.inner.remote()
    }

    /// Drains pending messages and disconnects.
    pub async fn close(mut self) {
        self.inner.close().await;
    }
}

/// Server side of the LOG channel.
pub struct LogCollector {
    server: Arc<dyn TransportServer>,
    history: Arc<Mutex<VecDeque<LogMessage>>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for LogCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCollector")
            .field("address", &self.server.connection_string())
            .finish()
    }
}

impl LogCollector {
    /// Binds `address` and starts recording. Messages are also appended to
    /// `output` when given.
    pub async fn listen(address: &str, output: Option<PathBuf>) -> AppResult<Self> {
        let server = transport::listen(address).await?;
        let file = match &output {
            Some(path) => Some(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?,
            ),
            None => None,
        };
        let history = Arc::new(Mutex::new(VecDeque::new()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::serve(
            Arc::clone(&server),
            Arc::clone(&history),
            file,
            cancel.clone(),
        ));
        info!("LogCollector listening on {}", server.connection_string());
        Ok(Self {
            server,
            history,
            cancel,
            task: Some(task),
        })
    }

    /// Address senders connect to.
    pub fn address(&self) -> String {
        self.server.connection_string()
    }

    /// Most recent messages, oldest first.
    pub fn received(&self) -> Vec<LogMessage> {
        self.history.lock().iter().cloned().collect()
    }

    /// Stops the server and waits for the receive loop.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.server.shutdown().await;
    }

    async fn serve(
        server: Arc<dyn TransportServer>,
        history: Arc<Mutex<VecDeque<LogMessage>>>,
        mut file: Option<tokio::fs::File>,
        cancel: CancellationToken,
    ) {
        let handshake = ServerHandshake::new(Channel::Log);
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = server.process(limits::IDLE_INTERVAL) => event,
            };
            let result = match event {
                None => continue,
                Some(TransportEvent::Connect(conn)) => handshake.on_connect(server.as_ref(), conn, true).await,
                Some(TransportEvent::Disconnect(conn)) => {
                    if let Some(info) = server.registry().reap(conn) {
                        debug!(conn = %conn, "Log sender {} disconnected", info);
                    }
                    Ok(())
                }
                Some(TransportEvent::Receive(conn, packet)) => {
                    match handshake.on_receive(server.as_ref(), conn, packet).await {
                        Ok(Inbound::Payload(payload)) => match LogMessage::decode(payload) {
                            Ok(msg) => {
                                record(&msg);
                                let failed = match file.as_mut() {
                                    Some(out) => match out.write_all(format!("{msg}\n").as_bytes()).await {
                                        Ok(()) => out.flush().await.err(),
                                        Err(e) => Some(e),
                                    },
                                    None => None,
                                };
                                if let Some(e) = failed {
                                    error!("Log file write failed, disabling file output: {}", e);
                                    file = None;
                                }
                                let mut history = history.lock();
                                if history.len() >= limits::LOG_QUEUE_CAPACITY {
                                    history.pop_front();
                                }
                                history.push_back(msg);
                                Ok(())
                            }
                            Err(e) => Err(e),
                        },
                        Ok(Inbound::Identified(_)) => Ok(()),
                        Err(e) => Err(e),
                    }
                }
            };
            if let Err(e) = result {
                warn!("LOG channel: {}", e);
            }
        }
        if let Some(mut out) = file {
            let _ = out.flush().await;
        }
    }
}

/// As a role, the LogCollector reports its LOG address on `SERVER`.
#[async_trait]
impl CommandHandler for LogCollector {
    async fn on_server(&mut self, ctx: &mut CommandContext) -> AppResult<()> {
        ctx.status.set_tag(TAG_SERVER, self.address());
        Ok(())
    }

    async fn on_status(&mut self, ctx: &mut CommandContext) -> AppResult<()> {
        ctx.status.set_tag("MESSAGES", self.history.lock().len());
        Ok(())
    }

    async fn on_log(&mut self, _ctx: &mut CommandContext, address: &str) -> AppResult<()> {
        debug!("Ignoring LOG {}: this role is the LogCollector", address);
        Ok(())
    }
}

fn record(msg: &LogMessage) {
    match msg.level {
        Level::Error => error!(target: "log_collector", sender = %msg.sender, "{}", msg.message),
        Level::Warn => warn!(target: "log_collector", sender = %msg.sender, "{}", msg.message),
        Level::Debug | Level::Extra => debug!(target: "log_collector", sender = %msg.sender, "{}", msg.message),
        _ => info!(target: "log_collector", sender = %msg.sender, level = %msg.level, "{}", msg.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_log_message_round_trip() {
        let msg = LogMessage::new(Level::Warn, "Queue nearly full")
            .at("producer.rs", 42)
            .with_tag("Queued", 9000);
        let back = LogMessage::decode(msg.encode()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_invalid_level_rejected() {
        let mut ser = Serializer::new();
        ser.put_u32(99);
        assert!(matches!(LogMessage::decode(ser.finish()), Err(DaqError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_collector_records_and_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daq.log");
        let collector = LogCollector::listen("tcp://127.0.0.1:0", Some(path.clone())).await.unwrap();

        let sender = LogSender::connect(&collector.address(), "Producer", "p1").await.unwrap();
        sender.send(LogMessage::new(Level::Error, "Readout failed")).unwrap();
        sender.close().await;

        let mut received = Vec::new();
        for _ in 0..50 {
            received = collector.received();
            if !received.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].sender, "Producer.p1");
        assert_eq!(received[0].level, Level::Error);

        let mut ctx = CommandContext::new("LogCollector", "");
        let mut collector = collector;
        collector.on_server(&mut ctx).await.unwrap();
        assert_eq!(ctx.status.tag(TAG_SERVER), Some(collector.address().as_str()));

        collector.shutdown().await;
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Producer.p1: Readout failed"));
    }
}
