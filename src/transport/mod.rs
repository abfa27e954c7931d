//! Packet transport between one client and a server's many connections.
//!
//! A transport moves opaque byte packets. It knows nothing about the handshake
//! or commands layered on top (see [`crate::protocol`]); it only reports
//! connect, disconnect and receive events and sends packets on request.
//!
//! Two implementations exist:
//! - [`tcp`]: framed TCP, each packet a 4-byte little-endian length plus payload
//! - [`null`]: a test double with no connections where every send succeeds
//!
//! Addresses select the implementation by scheme: `tcp://host:port` (or a bare
//! `host:port`) and `null://anything`.

pub mod null;
pub mod registry;
pub mod tcp;

pub use registry::{ConnectionId, ConnectionInfo, ConnectionRegistry, HandshakeState};

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Notification produced by a server for the owning layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer connected; it is registered but not yet identified.
    Connect(ConnectionId),
    /// A peer went away or its socket failed.
    Disconnect(ConnectionId),
    /// One complete packet arrived.
    Receive(ConnectionId, Bytes),
}

/// Destination of a server-side send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTarget {
    /// A single connection.
    One(ConnectionId),
    /// Every connected peer.
    All,
}

/// Server side: accepts many inbound connections.
#[async_trait]
pub trait TransportServer: Send + Sync {
    /// Address peers should use to reach this server, including the scheme.
    fn connection_string(&self) -> String;

    /// Arena holding one record per accepted connection.
    fn registry(&self) -> &Arc<ConnectionRegistry>;

    /// Sends one packet.
    ///
    /// Packets to unidentified connections are skipped unless
    /// `during_handshake` is set, in which case they are also written ahead
    /// of any queued application traffic.
    async fn send(&self, packet: Bytes, target: SendTarget, during_handshake: bool)
        -> AppResult<()>;

    /// Waits up to `timeout` for the next connection event.
    async fn process(&self, timeout: Duration) -> Option<TransportEvent>;

    /// Forcibly closes one connection. A `Disconnect` event follows.
    fn close(&self, conn: ConnectionId);

    /// Stops accepting and closes every connection.
    async fn shutdown(&self);
}

/// Client side: one connection to one server.
#[async_trait]
pub trait TransportClient: Send {
    /// Sends one packet.
    async fn send(&mut self, packet: &[u8]) -> AppResult<()>;

    /// Waits up to `timeout` for one packet. `Ok(None)` means the wait elapsed.
    async fn receive(&mut self, timeout: Duration) -> AppResult<Option<Bytes>>;

    /// Address this client is connected to.
    fn remote(&self) -> String;

    /// Whether this is the no-op test transport.
    fn is_null(&self) -> bool {
        false
    }
}

/// Parsed transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `tcp://host:port`, stored as `host:port`.
    Tcp(String),
    /// `null://...`, stored without the scheme.
    Null(String),
}

impl Address {
    /// Parses `scheme://rest`; a missing scheme means TCP.
    ///
    /// A TCP address consisting only of a port (`tcp://44000`) binds or
    /// connects on all interfaces / localhost respectively, resolved by the caller.
    pub fn parse(address: &str) -> AppResult<Self> {
        let address = address.trim();
        match address.split_once("://") {
            Some(("tcp", rest)) => Ok(Address::Tcp(rest.to_string())),
            Some(("null", rest)) => Ok(Address::Null(rest.to_string())),
            Some((scheme, _)) => Err(DaqError::Configuration(format!(
                "unknown transport scheme '{scheme}' in '{address}'"
            ))),
            None if address.is_empty() => Err(DaqError::Configuration(
                "empty transport address".to_string(),
            )),
            None => Ok(Address::Tcp(address.to_string())),
        }
    }

    /// Host/port for binding a listener.
    fn bind_target(host_port: &str) -> String {
        if let Ok(port) = host_port.trim_start_matches(':').parse::<u16>() {
            format!("0.0.0.0:{port}")
        } else {
            host_port.to_string()
        }
    }

    /// Host/port for connecting a client.
    fn connect_target(host_port: &str) -> String {
        if let Ok(port) = host_port.trim_start_matches(':').parse::<u16>() {
            format!("127.0.0.1:{port}")
        } else {
            host_port.to_string()
        }
    }
}

/// Starts a server for `address`.
pub async fn listen(address: &str) -> AppResult<Arc<dyn TransportServer>> {
    match Address::parse(address)? {
        Address::Tcp(host_port) => {
            let server = tcp::TcpServer::bind(&Address::bind_target(&host_port)).await?;
            Ok(Arc::new(server))
        }
        Address::Null(rest) => Ok(Arc::new(null::NullServer::new(rest))),
    }
}

/// Connects a client to `address`. Not retried here.
pub async fn connect(address: &str) -> AppResult<Box<dyn TransportClient>> {
    match Address::parse(address)? {
        Address::Tcp(host_port) => {
            let client = tcp::TcpClient::connect(&Address::connect_target(&host_port)).await?;
            Ok(Box::new(client))
        }
        Address::Null(rest) => Ok(Box::new(null::NullClient::new(rest))),
    }
}
