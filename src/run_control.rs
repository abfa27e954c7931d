//! Server side of the CMD channel: sequences every role through a run.
//!
//! RunControl owns the authoritative map of connected peers and their last
//! reported [`ConnectionState`]. A background task drives the transport:
//! it greets (or refuses) new connections, identifies them, caches every
//! status reply and completes the pending request of the peer that sent it.
//!
//! Commands are strictly request/reply. [`RunControl`] sends at most one
//! command per peer at a time and treats the reply as the acknowledgement of
//! the transition. When the reply does not yet show the target state it
//! falls back to bounded `STATUS` polling.
//!
//! # Run sequencing
//!
//! ```text
//! start_run:  others ──▶ DataCollectors ──▶ Producers   (each group RUNNING before the next)
//! stop_run:   Producers ──▶ DataCollectors ──▶ others   (each group CONF before the next)
//! ```
//!
//! # Bootstrap
//!
//! Every identified peer is bootstrapped on its own task:
//! - LogCollector: `SERVER`, then `LOG <address>` to everyone else
//! - DataCollector: `GETRUN`, `SERVER`, then `DATA <address>` to the producers it serves
//! - anything else: `LOG` and `DATA` when those addresses are known
//!
//! A DataCollector serves producers sharing its name; the first (or an
//! unnamed) DataCollector is the default for everyone else.

use crate::config::RunControlConfig;
use crate::error::{AppResult, DaqError};
use crate::limits;
use crate::log::{LogMessage, LogSender};
use crate::protocol::{Channel, Command, CommandLine, Inbound, ServerHandshake};
use crate::run_config::Configuration;
use crate::status::{ConnectionState, Level, State, TAG_RUN, TAG_SERVER};
use crate::transport::{self, Address, ConnectionId, ConnectionInfo, SendTarget, TransportEvent, TransportServer};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Order in which roles are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    Other,
    DataCollector,
    Producer,
}

impl Group {
    fn of(role: &str) -> Self {
        match role {
            "Producer" => Group::Producer,
            "DataCollector" => Group::DataCollector,
            _ => Group::Other,
        }
    }
}

type Reply = oneshot::Sender<AppResult<ConnectionState>>;

struct Peer {
    info: ConnectionInfo,
    status: Option<ConnectionState>,
    turn: Arc<tokio::sync::Mutex<()>>,
    pending: Option<Reply>,
    bootstrapped: bool,
}

impl Peer {
    fn state(&self) -> State {
        self.status.as_ref().map(|s| s.state).unwrap_or(State::Uninit)
    }
}

/// Snapshot of one peer for display or JSON export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    /// Connection handle.
    pub id: u64,
    /// Role from the handshake.
    pub role: String,
    /// Name from the handshake.
    pub name: String,
    /// Remote `ip:port`.
    pub remote: String,
    /// Last reply, absent until the peer answered once.
    pub status: Option<ConnectionState>,
}

impl PeerStatus {
    /// Reported state, `UNINIT` before the first reply.
    pub fn state(&self) -> State {
        self.status.as_ref().map(|s| s.state).unwrap_or(State::Uninit)
    }
}

/// Per-peer failures of a broadcast; empty when every peer succeeded.
pub type Failures = Vec<(ConnectionInfo, DaqError)>;

#[derive(Debug, Default)]
struct DataCollectors {
    /// Address per DataCollector connection, with its name.
    addresses: BTreeMap<ConnectionId, (String, String)>,
    default: Option<ConnectionId>,
}

impl DataCollectors {
    fn address_for(&self, name: &str) -> Option<String> {
        self.addresses
            .values()
            .find(|(dc_name, _)| !dc_name.is_empty() && dc_name == name)
            .or_else(|| self.default.and_then(|id| self.addresses.get(&id)))
            .map(|(_, address)| address.clone())
    }

    fn is_dedicated_name(&self, name: &str, except: ConnectionId) -> bool {
        self.addresses
            .iter()
            .any(|(id, (dc_name, _))| *id != except && !dc_name.is_empty() && dc_name == name)
    }
}

/// Run controller.
pub struct RunControl {
    server: Arc<dyn TransportServer>,
    handshake: ServerHandshake,
    config: RunControlConfig,
    peers: RwLock<BTreeMap<ConnectionId, Peer>>,
    run_number: Mutex<u32>,
    listening: AtomicBool,
    log_address: RwLock<Option<String>>,
    data: RwLock<DataCollectors>,
    log: Mutex<Option<LogSender>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RunControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunControl")
            .field("address", &self.server.connection_string())
            .field("peers", &self.peers.read().len())
            .field("run_number", &*self.run_number.lock())
            .finish()
    }
}

impl RunControl {
    /// Binds `config.listen` and starts the network loop.
    pub async fn listen(config: RunControlConfig) -> AppResult<Arc<Self>> {
        let server = transport::listen(&config.listen).await?;
        let rc = Arc::new(Self {
            server,
            handshake: ServerHandshake::new(Channel::Cmd),
            config,
            peers: RwLock::new(BTreeMap::new()),
            run_number: Mutex::new(0),
            listening: AtomicBool::new(true),
            log_address: RwLock::new(None),
            data: RwLock::new(DataCollectors::default()),
            log: Mutex::new(None),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(Arc::clone(&rc).process_loop());
        *rc.task.lock() = Some(task);
        info!("RunControl listening on {}", rc.address());
        Ok(rc)
    }

    /// Address roles connect to.
    pub fn address(&self) -> String {
        self.server.connection_string()
    }

    /// Last run number started or adopted; 0 before the first run.
    pub fn run_number(&self) -> u32 {
        *self.run_number.lock()
    }

    /// Whether new connections are accepted.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Accepts or refuses new connections.
    pub fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::Release);
    }

    /// Snapshot of every identified peer, ordered by connection.
    pub fn status(&self) -> Vec<PeerStatus> {
        self.peers
            .read()
            .values()
            .map(|peer| PeerStatus {
                id: peer.info.id.get(),
                role: peer.info.role.clone(),
                name: peer.info.name.clone(),
                remote: peer.info.remote.clone(),
                status: peer.status.clone(),
            })
            .collect()
    }

    /// Sends `STATUS` to every peer and returns the refreshed snapshot.
    pub async fn poll_status(&self) -> Vec<PeerStatus> {
        let ids: Vec<ConnectionId> = self.peers.read().keys().copied().collect();
        let results = join_all(ids.iter().map(|id| self.request(*id, CommandLine::new(Command::Status, "")))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                debug!(conn = %id, "STATUS failed: {}", e);
            }
        }
        self.status()
    }

    /// Waits until at least `count` peers are identified and bootstrapped.
    pub async fn wait_for_peers(&self, count: usize, timeout: Duration) -> AppResult<()> {
        let ready = || self.peers.read().values().filter(|p| p.bootstrapped).count() >= count;
        let wait = async {
            let mut ticker = tokio::time::interval(limits::PROCESS_TIMEOUT / 5);
            while !ready() {
                ticker.tick().await;
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DaqError::Shutdown),
            result = tokio::time::timeout(timeout, wait) => result
                .map_err(|_| DaqError::Timeout(format!("{count} peers to connect"))),
        }
    }

    /// Sends `INIT` to peers in `UNINIT`; peers in `UNCONF` are left alone.
    pub async fn initialise(&self, config: &Configuration) -> Failures {
        info!("Initialising");
        let targets = self.peers_matching(|_| true);
        let results = join_all(targets.iter().map(|(info, state)| async move {
            match state {
                State::Uninit => self
                    .command_until(info.id, CommandLine::new(Command::Init, config.text()), State::Unconf)
                    .await
                    .map(|_| ()),
                State::Unconf => Ok(()),
                other => Err(DaqError::state("INIT", other)),
            }
        }))
        .await;
        self.collect_failures("INIT", targets, results)
    }

    /// Clears peers, then sends `CONFIG` to peers in `UNCONF` or `CONF`.
    pub async fn configure(&self, config: &Configuration) -> Failures {
        info!("Configuring");
        self.broadcast(Command::Clear, "").await;
        let targets = self.peers_matching(|_| true);
        let results = join_all(targets.iter().map(|(info, state)| async move {
            match state {
                State::Unconf | State::Conf => self
                    .command_until(info.id, CommandLine::new(Command::Config, config.text()), State::Conf)
                    .await
                    .map(|_| ()),
                other => Err(DaqError::state("CONFIG", other)),
            }
        }))
        .await;
        self.collect_failures("CONFIG", targets, results)
    }

    /// Starts run `run`, or the next run number when `None`.
    ///
    /// New connections are refused until [`stop_run`](Self::stop_run) or
    /// [`reset`](Self::reset). Producers are started only after every
    /// DataCollector confirmed `RUNNING`; any earlier failure skips them.
    pub async fn start_run(&self, run: Option<u32>) -> (u32, Failures) {
        let run = {
            let mut current = self.run_number.lock();
            let next = match run {
                Some(run) => run,
                None => current.checked_add(1).unwrap_or_else(|| {
                    warn!(last = *current, "Run number space exhausted, wrapping to 0");
                    0
                }),
            };
            *current = next;
            next
        };
        self.set_listening(false);
        info!(run, "Starting run");

        let mut failures = Vec::new();
        let collectors = self.peers_matching(|p| Group::of(&p.info.role) == Group::DataCollector);
        let prepared = join_all(
            collectors
                .iter()
                .map(|(info, _)| self.request(info.id, CommandLine::new(Command::Prepare, run.to_string()))),
        )
        .await;
        failures.extend(self.collect_failures("PREPARE", collectors, prepared));

        for group in [Group::Other, Group::DataCollector, Group::Producer] {
            let members = self.peers_matching(|p| Group::of(&p.info.role) == group);
            let results = join_all(members.iter().map(|(info, _)| {
                self.command_until(info.id, CommandLine::new(Command::Start, run.to_string()), State::Running)
            }))
            .await;
            debug!(run, group = ?group, peers = members.len(), "Group started");
            failures.extend(self.collect_failures("START", members, results));
            if !failures.is_empty() && group != Group::Producer {
                warn!(run, group = ?group, failed = failures.len(), "Run start aborted before producers");
                break;
            }
        }
        (run, failures)
    }

    /// Stops the current run: Producers, then DataCollectors, then the rest.
    pub async fn stop_run(&self) -> Failures {
        info!(run = self.run_number(), "Stopping run");
        let mut failures = Vec::new();
        for group in [Group::Producer, Group::DataCollector, Group::Other] {
            let members = self.peers_matching(|p| Group::of(&p.info.role) == group);
            let results = join_all(
                members
                    .iter()
                    .map(|(info, _)| self.command_until(info.id, CommandLine::new(Command::Stop, ""), State::Conf)),
            )
            .await;
            failures.extend(self.collect_failures("STOP", members, results));
        }
        self.set_listening(true);
        failures
    }

    /// Returns every peer to `UNINIT` and accepts connections again.
    pub async fn reset(&self) -> Failures {
        info!("Resetting");
        self.set_listening(true);
        let targets = self.peers_matching(|_| true);
        let results = join_all(
            targets
                .iter()
                .map(|(info, _)| self.command_until(info.id, CommandLine::new(Command::Reset, ""), State::Uninit)),
        )
        .await;
        self.collect_failures("RESET", targets, results)
    }

    /// Sends `TERMINATE` to everyone, waits the grace period, then shuts down.
    pub async fn terminate(&self) {
        info!("Terminating connections");
        self.broadcast(Command::Terminate, "").await;
        tokio::time::sleep(self.config.terminate_grace).await;
        self.shutdown().await;
    }

    /// Stops the network loop and closes the server.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let pending: Vec<Reply> = self
            .peers
            .write()
            .values_mut()
            .filter_map(|p| p.pending.take())
            .collect();
        for reply in pending {
            let _ = reply.send(Err(DaqError::Shutdown));
        }
        self.server.shutdown().await;
        let log = self.log.lock().take();
        if let Some(log) = log {
            log.close().await;
        }
    }

    async fn process_loop(self: Arc<Self>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.server.process(limits::PROCESS_TIMEOUT) => event,
            };
            match event {
                None => {}
                Some(TransportEvent::Connect(conn)) => {
                    if let Err(e) = self.handshake.on_connect(self.server.as_ref(), conn, self.is_listening()).await {
                        warn!(conn = %conn, "Greeting failed: {}", e);
                    }
                }
                Some(TransportEvent::Receive(conn, packet)) => {
                    match self.handshake.on_receive(self.server.as_ref(), conn, packet).await {
                        Ok(Inbound::Identified(info)) => self.on_identified(info),
                        Ok(Inbound::Payload(payload)) => self.on_reply(conn, payload),
                        Err(e) => warn!(conn = %conn, "CMD channel: {}", e),
                    }
                }
                Some(TransportEvent::Disconnect(conn)) => self.on_disconnect(conn),
            }
        }
        debug!("RunControl network loop stopped");
    }

    fn on_identified(self: &Arc<Self>, info: ConnectionInfo) {
        let id = info.id;
        self.peers.write().insert(
            id,
            Peer {
                info,
                status: None,
                turn: Arc::new(tokio::sync::Mutex::new(())),
                pending: None,
                bootstrapped: false,
            },
        );
        let rc = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = rc.bootstrap(id).await {
                rc.report(Level::Error, &format!("Bootstrap of connection {id} failed: {e}"));
            }
            if let Some(peer) = rc.peers.write().get_mut(&id) {
                peer.bootstrapped = true;
            }
        });
    }

    fn on_reply(&self, conn: ConnectionId, payload: bytes::Bytes) {
        let status = match ConnectionState::decode(payload) {
            Ok(status) => status,
            Err(e) => {
                warn!(conn = %conn, "Undecodable status reply: {}", e);
                return;
            }
        };
        self.server.registry().set_busy(conn, status.is_busy());
        let mut peers = self.peers.write();
        let Some(peer) = peers.get_mut(&conn) else {
            debug!(conn = %conn, "Reply from unknown connection");
            return;
        };
        if status.state == State::Error && peer.state() != State::Error {
            error!(conn = %conn, role = %peer.info.role, name = %peer.info.name, "Peer reports ERROR: {}", status.message);
        }
        peer.status = Some(status.clone());
        match peer.pending.take() {
            Some(reply) => {
                let _ = reply.send(Ok(status));
            }
            None => debug!(conn = %conn, "Unsolicited status {}", status),
        }
    }

    fn on_disconnect(&self, conn: ConnectionId) {
        let removed = self.peers.write().remove(&conn);
        {
            let mut data = self.data.write();
            data.addresses.remove(&conn);
            if data.default == Some(conn) {
                data.default = None;
            }
        }
        self.server.registry().reap(conn);
        if let Some(mut peer) = removed {
            info!(conn = %conn, "Disconnected: {}", peer.info);
            if let Some(reply) = peer.pending.take() {
                let _ = reply.send(Err(DaqError::Connection(format!("{} disconnected", peer.info))));
            }
        }
    }

    async fn bootstrap(&self, id: ConnectionId) -> AppResult<()> {
        let info = self
            .peers
            .read()
            .get(&id)
            .map(|p| p.info.clone())
            .ok_or_else(|| DaqError::Connection(format!("connection {id} is gone")))?;
        match info.role.as_str() {
            "LogCollector" => self.bootstrap_log_collector(&info).await,
            "DataCollector" => self.bootstrap_data_collector(&info).await,
            _ => {
                let log = self.log_address.read().clone();
                if let Some(address) = log {
                    self.request(id, CommandLine::new(Command::Log, address)).await?;
                }
                let data = self.data.read().address_for(&info.name);
                if let Some(address) = data {
                    self.request(id, CommandLine::new(Command::Data, address)).await?;
                }
                Ok(())
            }
        }
    }

    async fn bootstrap_log_collector(&self, info: &ConnectionInfo) -> AppResult<()> {
        if self.log_address.read().is_some() {
            warn!("LogCollector already connected, ignoring {}", info);
            return Ok(());
        }
        let status = self.request(info.id, CommandLine::new(Command::Server, "")).await?;
        let reported = status
            .tag(TAG_SERVER)
            .ok_or_else(|| DaqError::Protocol(format!("{info} did not report its address")))?;
        let address = collector_address(reported, info)?;
        info!("LogCollector at {}", address);
        *self.log_address.write() = Some(address.clone());

        match LogSender::connect(&address, "RunControl", "").await {
            Ok(sender) => *self.log.lock() = Some(sender),
            Err(e) => warn!("RunControl cannot forward logs to {}: {}", address, e),
        }
        let others = self.peers_matching(|p| p.info.id != info.id);
        join_all(
            others
                .iter()
                .map(|(peer, _)| self.request(peer.id, CommandLine::new(Command::Log, address.clone()))),
        )
        .await;
        Ok(())
    }

    async fn bootstrap_data_collector(&self, info: &ConnectionInfo) -> AppResult<()> {
        let status = self.request(info.id, CommandLine::new(Command::GetRun, "")).await?;
        if let Some(reported) = status.tag(TAG_RUN).and_then(|r| r.parse::<u32>().ok()) {
            let mut current = self.run_number.lock();
            if reported != *current {
                info!(previous = *current, reported, "Adopting run number of DataCollector {}", info);
                *current = reported;
            }
        }

        let status = self.request(info.id, CommandLine::new(Command::Server, "")).await?;
        let reported = status
            .tag(TAG_SERVER)
            .ok_or_else(|| DaqError::Protocol(format!("{info} did not report its address")))?;
        let address = collector_address(reported, info)?;

        let is_default = {
            let mut data = self.data.write();
            let is_default = info.name.is_empty() || data.default.is_none();
            if is_default {
                data.default = Some(info.id);
            }
            data.addresses.insert(info.id, (info.name.clone(), address.clone()));
            is_default
        };
        info!(default = is_default, "DataCollector {} at {}", info.name, address);

        let served = {
            let data = self.data.read();
            self.peers_matching(|p| {
                p.info.id != info.id
                    && !matches!(p.info.role.as_str(), "DataCollector" | "LogCollector")
                    && if is_default {
                        !data.is_dedicated_name(&p.info.name, info.id)
                    } else {
                        p.info.name == info.name
                    }
            })
        };
        join_all(
            served
                .iter()
                .map(|(peer, _)| self.request(peer.id, CommandLine::new(Command::Data, address.clone()))),
        )
        .await;

        let log = self.log_address.read().clone();
        if let Some(log) = log {
            self.request(info.id, CommandLine::new(Command::Log, log)).await?;
        }
        Ok(())
    }

    /// Sends one command and waits for its status reply.
    async fn request(&self, id: ConnectionId, line: CommandLine) -> AppResult<ConnectionState> {
        let turn = self
            .peers
            .read()
            .get(&id)
            .map(|p| Arc::clone(&p.turn))
            .ok_or_else(|| DaqError::Connection(format!("connection {id} is gone")))?;
        let _turn = turn.lock().await;

        let (tx, rx) = oneshot::channel();
        let registered = match self.peers.write().get_mut(&id) {
            Some(peer) => {
                peer.pending = Some(tx);
                true
            }
            None => false,
        };
        if !registered {
            return Err(DaqError::Connection(format!("connection {id} is gone")));
        }
        debug!(conn = %id, command = %line.command, "Sending");
        if let Err(e) = self.server.send(line.encode(), SendTarget::One(id), false).await {
            self.clear_pending(id);
            return Err(e);
        }
        match tokio::time::timeout(self.config.command_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DaqError::Connection(format!(
                "connection {id} closed before replying to {}",
                line.command
            ))),
            Err(_) => {
                self.clear_pending(id);
                Err(DaqError::Timeout(format!("reply to {} from connection {id}", line.command)))
            }
        }
    }

    fn clear_pending(&self, id: ConnectionId) {
        if let Some(peer) = self.peers.write().get_mut(&id) {
            peer.pending = None;
        }
    }

    /// Sends `line` and waits until the peer reports `target`.
    ///
    /// The reply is the acknowledgement; if it shows another state the peer
    /// is polled with `STATUS` up to the configured number of times.
    async fn command_until(&self, id: ConnectionId, line: CommandLine, target: State) -> AppResult<ConnectionState> {
        let keyword = line.command.keyword().to_string();
        let mut status = self.request(id, line).await?;
        let mut ticker = tokio::time::interval(self.config.state_poll_interval);
        ticker.tick().await;
        let mut attempts = 0;
        loop {
            if status.state == target {
                return Ok(status);
            }
            if status.state == State::Error {
                return Err(DaqError::state(keyword, format!("{} ({})", status.state, status.message)));
            }
            if attempts >= self.config.state_poll_attempts {
                return Err(DaqError::Timeout(format!(
                    "connection {id} to reach {target} after {keyword}, still {}",
                    status.state
                )));
            }
            attempts += 1;
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(DaqError::Shutdown),
                _ = ticker.tick() => {}
            }
            status = self.request(id, CommandLine::new(Command::Status, "")).await?;
        }
    }

    /// Sends `command` to every peer and waits for all replies.
    async fn broadcast(&self, command: Command, param: &str) {
        let ids: Vec<ConnectionId> = self.peers.read().keys().copied().collect();
        let results = join_all(
            ids.iter()
                .map(|id| self.request(*id, CommandLine::new(command.clone(), param))),
        )
        .await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                debug!(conn = %id, command = %command, "Broadcast reply missing: {}", e);
            }
        }
    }

    fn peers_matching(&self, pred: impl Fn(&Peer) -> bool) -> Vec<(ConnectionInfo, State)> {
        self.peers
            .read()
            .values()
            .filter(|p| pred(p))
            .map(|p| (p.info.clone(), p.state()))
            .collect()
    }

    fn collect_failures<T>(
        &self,
        command: &str,
        targets: Vec<(ConnectionInfo, State)>,
        results: Vec<AppResult<T>>,
    ) -> Failures {
        targets
            .into_iter()
            .zip(results)
            .filter_map(|((info, _), result)| match result {
                Ok(_) => None,
                Err(e) => {
                    self.report(Level::Error, &format!("{command} failed for {info}: {e}"));
                    Some((info, e))
                }
            })
            .collect()
    }

    fn report(&self, level: Level, message: &str) {
        if level >= Level::Error {
            error!("{}", message);
        } else {
            warn!("{}", message);
        }
        if let Some(log) = self.log.lock().as_ref() {
            if let Err(e) = log.send(LogMessage::new(level, message)) {
                debug!("Log forwarding failed: {}", e);
            }
        }
    }
}

/// Address reachable from other hosts: the collector's IP as seen by
/// RunControl plus the port it reported.
fn collector_address(reported: &str, peer: &ConnectionInfo) -> AppResult<String> {
    match Address::parse(reported)? {
        Address::Null(_) => Ok(reported.to_string()),
        Address::Tcp(host_port) => {
            let port = host_port.rsplit_once(':').map(|(_, p)| p).unwrap_or(&host_port);
            let host = peer.remote_host();
            if host.contains(':') {
                Ok(format!("tcp://[{host}]:{port}"))
            } else {
                Ok(format!("tcp://{host}:{port}"))
            }
        }
    }
}
