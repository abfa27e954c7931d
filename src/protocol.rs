//! Connection handshake and command framing.
//!
//! # Handshake
//!
//! ```text
//! server                                   client
//!   | -- "OK EUDAQ <CH> <ServerRole> <peer>" -->|   (or "ERROR EUDAQ <CH> <reason>", then close)
//!   |<-- "OK EUDAQ <CH> <Role> <Name>" ---------|
//!   | -- "OK" --------------------------------->|
//!   |        application payload only           |
//! ```
//!
//! Both sides track `UNIDENTIFIED -> IDENTIFIED`. The server is tolerant: a
//! malformed identification leaves role and name empty but still identifies
//! the connection. The client is strict: anything but the expected greeting
//! is a [`DaqError::Protocol`] carrying the literal packet.
//!
//! # Commands
//!
//! On CMD channels each packet is `KEYWORD` or `KEYWORD\0param`.

use crate::error::{AppResult, DaqError};
use crate::transport::{
    ConnectionId, ConnectionInfo, HandshakeState, SendTarget, TransportClient, TransportServer,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Logical channel carried by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Commands from RunControl.
    Cmd,
    /// Serialized events towards a DataCollector.
    Data,
    /// Log messages towards a LogCollector.
    Log,
}

impl Channel {
    /// Token used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Cmd => "CMD",
            Channel::Data => "DATA",
            Channel::Log => "LOG",
        }
    }

    /// Role name the server announces on this channel.
    pub fn server_role(self) -> &'static str {
        match self {
            Channel::Cmd => "RunControl",
            Channel::Data => "DataCollector",
            Channel::Log => "LogCollector",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Greeting sent by a server that accepts the connection.
pub fn greeting(channel: Channel, peer: &str) -> String {
    if peer.is_empty() {
        format!("OK EUDAQ {} {}", channel, channel.server_role())
    } else {
        format!("OK EUDAQ {} {} {}", channel, channel.server_role(), peer)
    }
}

/// Refusal sent before the server closes the connection.
pub fn refusal(channel: Channel, reason: &str) -> String {
    format!("ERROR EUDAQ {channel} {reason}")
}

/// Identification reply sent by a client.
pub fn identification(channel: Channel, role: &str, name: &str) -> String {
    format!("OK EUDAQ {channel} {role} {name}")
}

/// Best-effort parse of an identification reply into `(role, name)`.
///
/// Stops at the first token that does not match and returns whatever was
/// collected so far, so malformed input yields empty strings.
pub fn parse_identification(packet: &[u8], channel: Channel) -> (String, String) {
    let text = String::from_utf8_lossy(packet);
    let mut tokens = text.split_whitespace();
    let mut role = String::new();
    let mut name = String::new();
    if tokens.next() == Some("OK")
        && tokens.next() == Some("EUDAQ")
        && tokens.next() == Some(channel.as_str())
    {
        if let Some(r) = tokens.next() {
            role = r.to_string();
            if let Some(n) = tokens.next() {
                name = n.to_string();
            }
        }
    }
    (role, name)
}

/// Client-side handshake state machine.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    channel: Channel,
    role: String,
    name: String,
    state: HandshakeState,
    peer_view: Option<String>,
}

impl ClientHandshake {
    /// Starts a handshake for a client with the given identity.
    pub fn new(channel: Channel, role: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            channel,
            role: role.into(),
            name: name.into(),
            state: HandshakeState::Unidentified,
            peer_view: None,
        }
    }

    /// Checks the server greeting and returns the identification to send.
    pub fn on_greeting(&mut self, packet: &[u8]) -> AppResult<String> {
        let text = String::from_utf8_lossy(packet);
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let expected = ["OK", "EUDAQ", self.channel.as_str(), self.channel.server_role()];
        if tokens.len() < 4 || tokens[..4] != expected {
            if tokens.first() == Some(&"ERROR") {
                return Err(DaqError::Protocol(format!("Connection refused by server: '{text}'")));
            }
            return Err(DaqError::Protocol(format!("Invalid response from server: '{text}'")));
        }
        self.peer_view = tokens.get(4).map(|s| s.to_string());
        Ok(identification(self.channel, &self.role, &self.name))
    }

    /// Checks the acknowledgement.
    ///
    /// Returns `true` on the transition to identified; a duplicate
    /// acknowledgement afterwards returns `false` and changes nothing.
    pub fn on_ack(&mut self, packet: &[u8]) -> AppResult<bool> {
        if self.state.is_identified() {
            return Ok(false);
        }
        let text = String::from_utf8_lossy(packet);
        if text.split_whitespace().next() != Some("OK") {
            return Err(DaqError::Protocol(format!("Connection refused: '{text}'")));
        }
        self.state = HandshakeState::Identified;
        Ok(true)
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Our own address as seen by the server, when the greeting carried it.
    pub fn peer_view(&self) -> Option<&str> {
        self.peer_view.as_deref()
    }

    /// Runs the full exchange over `client`.
    ///
    /// The null transport has no server to talk to and is identified at once.
    pub async fn perform(
        mut self,
        client: &mut dyn TransportClient,
        greeting_timeout: Duration,
        ack_timeout: Duration,
    ) -> AppResult<Self> {
        if client.is_null() {
            self.state = HandshakeState::Identified;
            return Ok(self);
        }
        let greeting = client
            .receive(greeting_timeout)
            .await?
            .ok_or_else(|| DaqError::Timeout(format!("greeting from {}", client.remote())))?;
        let reply = self.on_greeting(&greeting)?;
        client.send(reply.as_bytes()).await?;
        let ack = client
            .receive(ack_timeout)
            .await?
            .ok_or_else(|| DaqError::Timeout(format!("acknowledgement from {}", client.remote())))?;
        self.on_ack(&ack)?;
        debug!(channel = %self.channel, role = %self.role, name = %self.name, "Handshake complete with {}", client.remote());
        Ok(self)
    }
}

/// Outcome of feeding a packet through [`ServerHandshake::on_receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The packet identified the connection.
    Identified(ConnectionInfo),
    /// Application payload on an identified connection.
    Payload(Bytes),
}

/// Server-side handshake shared by RunControl, DataReceiver and LogCollector.
#[derive(Debug, Clone, Copy)]
pub struct ServerHandshake {
    channel: Channel,
}

impl ServerHandshake {
    /// Handshake for servers of `channel`.
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Channel served.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Greets a new connection, or refuses and closes it.
    pub async fn on_connect(
        &self,
        server: &dyn TransportServer,
        conn: ConnectionId,
        accepting: bool,
    ) -> AppResult<()> {
        let peer = server.registry().get(conn).map(|i| i.remote).unwrap_or_default();
        if accepting {
            let text = greeting(self.channel, &peer);
            server.send(Bytes::from(text), SendTarget::One(conn), true).await
        } else {
            info!(conn = %conn, "Refusing {} connection from {}", self.channel, peer);
            let text = refusal(self.channel, "Not accepting new connections");
            let sent = server.send(Bytes::from(text), SendTarget::One(conn), true).await;
            server.close(conn);
            sent
        }
    }

    /// Handles one received packet.
    pub async fn on_receive(
        &self,
        server: &dyn TransportServer,
        conn: ConnectionId,
        packet: Bytes,
    ) -> AppResult<Inbound> {
        let registry = server.registry();
        if registry.is_identified(conn) {
            return Ok(Inbound::Payload(packet));
        }
        let (role, name) = parse_identification(&packet, self.channel);
        if role.is_empty() {
            warn!(conn = %conn, "Malformed {} identification: '{}'", self.channel, String::from_utf8_lossy(&packet));
        }
        registry.identify(conn, &role, &name);
        server
            .send(Bytes::from_static(b"OK"), SendTarget::One(conn), true)
            .await?;
        let info = registry
            .get(conn)
            .ok_or_else(|| DaqError::Connection(format!("connection {conn} vanished during handshake")))?;
        info!(conn = %conn, role = %info.role, name = %info.name, "{} connection identified from {}", self.channel, info.remote);
        Ok(Inbound::Identified(info))
    }
}

/// Command keyword on the CMD channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Stop if running and clear the status message.
    Clear,
    /// Initialise with the role-scoped configuration.
    Init,
    /// Configure with the role-scoped configuration.
    Config,
    /// Prepare for the given run number.
    Prepare,
    /// Start the given run number.
    Start,
    /// Stop the current run.
    Stop,
    /// Shut the role down.
    Terminate,
    /// Return to the uninitialised state.
    Reset,
    /// Report status only.
    Status,
    /// Address of the DataCollector to send events to.
    Data,
    /// Address of the LogCollector to send logs to.
    Log,
    /// Report our own listen address.
    Server,
    /// Report our current run number.
    GetRun,
    /// Anything else.
    Unrecognised(String),
}

impl Command {
    /// Wire keyword.
    pub fn keyword(&self) -> &str {
        match self {
            Command::Clear => "CLEAR",
            Command::Init => "INIT",
            Command::Config => "CONFIG",
            Command::Prepare => "PREPARE",
            Command::Start => "START",
            Command::Stop => "STOP",
            Command::Terminate => "TERMINATE",
            Command::Reset => "RESET",
            Command::Status => "STATUS",
            Command::Data => "DATA",
            Command::Log => "LOG",
            Command::Server => "SERVER",
            Command::GetRun => "GETRUN",
            Command::Unrecognised(keyword) => keyword,
        }
    }

    /// Maps a keyword onto a command.
    pub fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "CLEAR" => Command::Clear,
            "INIT" => Command::Init,
            "CONFIG" => Command::Config,
            "PREPARE" => Command::Prepare,
            "START" => Command::Start,
            "STOP" => Command::Stop,
            "TERMINATE" => Command::Terminate,
            "RESET" => Command::Reset,
            "STATUS" => Command::Status,
            "DATA" => Command::Data,
            "LOG" => Command::Log,
            "SERVER" => Command::Server,
            "GETRUN" => Command::GetRun,
            other => Command::Unrecognised(other.to_string()),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

/// One command with its parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Command keyword.
    pub command: Command,
    /// Parameter, empty when absent.
    pub param: String,
}

impl CommandLine {
    /// Builds a command line.
    pub fn new(command: Command, param: impl Into<String>) -> Self {
        Self {
            command,
            param: param.into(),
        }
    }

    /// Encodes as `KEYWORD` or `KEYWORD\0param`.
    pub fn encode(&self) -> Bytes {
        let keyword = self.command.keyword();
        let mut buf = BytesMut::with_capacity(keyword.len() + 1 + self.param.len());
        buf.put_slice(keyword.as_bytes());
        if !self.param.is_empty() {
            buf.put_u8(0);
            buf.put_slice(self.param.as_bytes());
        }
        buf.freeze()
    }

    /// Splits at the first NUL; never fails.
    pub fn decode(packet: &[u8]) -> Self {
        let (keyword, param) = match packet.iter().position(|&b| b == 0) {
            Some(i) => (&packet[..i], &packet[i + 1..]),
            None => (packet, &packet[packet.len()..]),
        };
        Self {
            command: Command::from_keyword(String::from_utf8_lossy(keyword).trim()),
            param: String::from_utf8_lossy(param).into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_text() {
        assert_eq!(greeting(Channel::Cmd, ""), "OK EUDAQ CMD RunControl");
        assert_eq!(
            greeting(Channel::Data, "10.0.0.5:4000"),
            "OK EUDAQ DATA DataCollector 10.0.0.5:4000"
        );
        assert_eq!(
            refusal(Channel::Cmd, "Not accepting new connections"),
            "ERROR EUDAQ CMD Not accepting new connections"
        );
    }

    #[test]
    fn test_parse_identification_tolerates_garbage() {
        assert_eq!(
            parse_identification(b"OK EUDAQ CMD Producer p1", Channel::Cmd),
            ("Producer".to_string(), "p1".to_string())
        );
        assert_eq!(
            parse_identification(b"OK EUDAQ CMD Producer", Channel::Cmd),
            ("Producer".to_string(), String::new())
        );
        assert_eq!(
            parse_identification(b"OK EUDAQ DATA Producer p1", Channel::Cmd),
            (String::new(), String::new())
        );
        assert_eq!(parse_identification(b"", Channel::Cmd), (String::new(), String::new()));
        assert_eq!(
            parse_identification(&[0xff, 0x00, 0x13], Channel::Log),
            (String::new(), String::new())
        );
    }

    #[test]
    fn test_client_rejects_wrong_greeting() {
        let mut hs = ClientHandshake::new(Channel::Cmd, "Producer", "p1");
        let err = hs.on_greeting(b"OK EUDAQ DATA DataCollector").unwrap_err();
        assert!(err.to_string().contains("OK EUDAQ DATA DataCollector"));

        let err = hs.on_greeting(b"ERROR EUDAQ CMD Not accepting new connections").unwrap_err();
        assert!(err.to_string().contains("refused"));

        assert!(hs.on_greeting(b"OK EUDAQ").is_err());
    }

    #[test]
    fn test_client_identified_exactly_once() {
        let mut hs = ClientHandshake::new(Channel::Cmd, "Producer", "p1");
        let reply = hs.on_greeting(b"OK EUDAQ CMD RunControl 127.0.0.1:5555").unwrap();
        assert_eq!(reply, "OK EUDAQ CMD Producer p1");
        assert_eq!(hs.peer_view(), Some("127.0.0.1:5555"));

        assert!(hs.on_ack(b"OK").unwrap());
        assert_eq!(hs.state(), HandshakeState::Identified);
        assert!(!hs.on_ack(b"OK").unwrap());
        assert!(!hs.on_ack(b"garbage").unwrap());
        assert_eq!(hs.state(), HandshakeState::Identified);
    }

    #[test]
    fn test_client_rejects_bad_ack() {
        let mut hs = ClientHandshake::new(Channel::Data, "Producer", "p1");
        hs.on_greeting(b"OK EUDAQ DATA DataCollector").unwrap();
        assert!(hs.on_ack(b"ERROR").is_err());
        assert_eq!(hs.state(), HandshakeState::Unidentified);
    }

    #[test]
    fn test_command_line_encoding() {
        let line = CommandLine::new(Command::Start, "42");
        assert_eq!(&line.encode()[..], b"START\x0042");
        assert_eq!(&CommandLine::new(Command::Stop, "").encode()[..], b"STOP");

        let decoded = CommandLine::decode(b"CONFIG\0a\0b");
        assert_eq!(decoded.command, Command::Config);
        assert_eq!(decoded.param, "a\0b");

        let decoded = CommandLine::decode(b"FROB");
        assert_eq!(decoded.command, Command::Unrecognised("FROB".into()));
        assert!(decoded.param.is_empty());
        assert_eq!(CommandLine::decode(b"").command, Command::Unrecognised(String::new()));
    }
}
