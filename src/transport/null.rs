//! No-op transport used as a test double.
//!
//! The server never produces connections and the client never receives
//! anything; every send succeeds. Waits still honour their timeout so the
//! loops driving them do not spin.

use super::{ConnectionId, ConnectionRegistry, SendTarget, TransportClient, TransportEvent, TransportServer};
use crate::error::AppResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Server half of the null transport.
#[derive(Debug, Default)]
pub struct NullServer {
    param: String,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
}

impl NullServer {
    /// Creates a server; `param` is kept only for the connection string.
    pub fn new(param: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            registry: Arc::new(ConnectionRegistry::new()),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl TransportServer for NullServer {
    fn connection_string(&self) -> String {
        format!("null://{}", self.param)
    }

    fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    async fn send(&self, _packet: Bytes, _target: SendTarget, _during_handshake: bool) -> AppResult<()> {
        Ok(())
    }

    async fn process(&self, timeout: Duration) -> Option<TransportEvent> {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
        None
    }

    fn close(&self, _conn: ConnectionId) {}

    async fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Client half of the null transport.
#[derive(Debug, Default)]
pub struct NullClient {
    param: String,
}

impl NullClient {
    /// Creates a client that talks to nobody.
    pub fn new(param: impl Into<String>) -> Self {
        Self { param: param.into() }
    }
}

#[async_trait]
impl TransportClient for NullClient {
    async fn send(&mut self, _packet: &[u8]) -> AppResult<()> {
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> AppResult<Option<Bytes>> {
        tokio::time::sleep(timeout).await;
        Ok(None)
    }

    fn remote(&self) -> String {
        format!("null://{}", self.param)
    }

    fn is_null(&self) -> bool {
        true
    }
}
