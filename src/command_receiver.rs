//! Client side of the CMD channel and the command dispatch loop.
//!
//! Every role except RunControl embeds a [`CommandReceiver`]. It connects to
//! RunControl (retrying only the connection step), performs the handshake,
//! then loops: wait up to the idle interval for a command, dispatch it to the
//! role's [`CommandHandler`], send the resulting [`ConnectionState`] back as
//! the reply, run the idle hook.
//!
//! Handler failures never end the loop. An `Err` or a panic puts the role in
//! `ERROR` with the reason as the status message, and the message is
//! forwarded to the LogCollector when one is connected.

use crate::config::CommandReceiverConfig;
use crate::error::{AppResult, DaqError};
use crate::log::{LogMessage, LogSender};
use crate::protocol::{Channel, ClientHandshake, Command, CommandLine};
use crate::run_config::{ConfigSection, Configuration};
use crate::status::{ConnectionState, Level, State, TAG_RUN};
use crate::transport::{self, TransportClient};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Role-side state shared between the dispatcher and the handler.
pub struct CommandContext {
    role: String,
    name: String,
    /// Status returned to RunControl after every command.
    pub status: ConnectionState,
    /// Run number from the last `START`.
    pub run_number: u32,
    /// Configuration from the last `INIT` or `CONFIG`.
    pub config: Configuration,
    /// DataCollector address from the last `DATA` command.
    pub data_address: Option<String>,
    log: Option<LogSender>,
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("role", &self.role)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("run_number", &self.run_number)
            .field("log", &self.log.as_ref().map(|l| l.remote()))
            .finish()
    }
}

impl CommandContext {
    /// Fresh context in `UNINIT`.
    pub fn new(role: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            name: name.into(),
            status: ConnectionState::default(),
            run_number: 0,
            config: Configuration::default(),
            data_address: None,
            log: None,
        }
    }

    /// Role announced in the handshake.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Name announced in the handshake.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.status.state
    }

    /// Rejects `command` unless the role is in `expected`.
    pub fn require_state(&self, command: &str, expected: State) -> AppResult<()> {
        if self.status.state == expected {
            Ok(())
        } else {
            Err(DaqError::state(command, self.status.state))
        }
    }

    /// Logs locally and forwards to the LogCollector when connected.
    pub fn report(&self, level: Level, message: &str) {
        match level {
            Level::Error => error!(role = %self.role, name = %self.name, "{}", message),
            Level::Warn => warn!(role = %self.role, name = %self.name, "{}", message),
            Level::Debug | Level::Extra => debug!(role = %self.role, name = %self.name, "{}", message),
            _ => info!(role = %self.role, name = %self.name, "{}", message),
        }
        if let Some(log) = &self.log {
            if let Err(e) = log.send(LogMessage::new(level, message)) {
                debug!("Log forwarding to {} failed: {}", log.remote(), e);
            }
        }
    }

    /// Connects a LogSender, replacing any previous one.
    pub async fn connect_log(&mut self, address: &str) -> AppResult<()> {
        if let Some(old) = self.log.take() {
            old.close().await;
        }
        self.log = Some(LogSender::connect(address, &self.role, &self.name).await?);
        Ok(())
    }

    /// Connected LogSender, if any.
    pub fn log_sender(&self) -> Option<&LogSender> {
        self.log.as_ref()
    }

    fn fail(&mut self, message: String) {
        self.report(Level::Error, &message);
        self.status.set(State::Error, message);
    }

    async fn close(&mut self) {
        if let Some(log) = self.log.take() {
            log.close().await;
        }
    }
}

/// Role callbacks invoked by the dispatcher, one per command keyword.
///
/// Defaults perform the standard transition, so a role only overrides what
/// it needs. An overriding handler is responsible for the state change it
/// replaces.
#[async_trait]
pub trait CommandHandler: Send {
    /// `CLEAR`, after the dispatcher stopped a running run.
    async fn on_clear(&mut self, _ctx: &mut CommandContext) -> AppResult<()> {
        Ok(())
    }

    /// `INIT` with this role's configuration section.
    async fn on_initialise(&mut self, ctx: &mut CommandContext, _config: ConfigSection) -> AppResult<()> {
        ctx.status.set(State::Unconf, "Initialised");
        Ok(())
    }

    /// `CONFIG` with this role's configuration section.
    async fn on_configure(&mut self, ctx: &mut CommandContext, _config: ConfigSection) -> AppResult<()> {
        ctx.status.set(State::Conf, "Configured");
        Ok(())
    }

    /// `PREPARE` for the given run.
    async fn on_prepare(&mut self, _ctx: &mut CommandContext, _run: u32) -> AppResult<()> {
        Ok(())
    }

    /// `START`. The dispatcher does not check the state; this does.
    async fn on_start_run(&mut self, ctx: &mut CommandContext, run: u32) -> AppResult<()> {
        ctx.require_state("START", State::Conf)?;
        ctx.status.set(State::Running, format!("Running run {run}"));
        Ok(())
    }

    /// `STOP`, only ever called while `RUNNING`.
    async fn on_stop_run(&mut self, ctx: &mut CommandContext) -> AppResult<()> {
        ctx.status.set(State::Conf, "Stopped");
        Ok(())
    }

    /// `TERMINATE`; the loop ends after the reply.
    async fn on_terminate(&mut self, _ctx: &mut CommandContext) -> AppResult<()> {
        Ok(())
    }

    /// `RESET`.
    async fn on_reset(&mut self, ctx: &mut CommandContext) -> AppResult<()> {
        ctx.status.set(State::Uninit, "Reset");
        Ok(())
    }

    /// `STATUS`; may refresh status tags.
    async fn on_status(&mut self, _ctx: &mut CommandContext) -> AppResult<()> {
        Ok(())
    }

    /// `DATA` with the DataCollector address.
    async fn on_data(&mut self, ctx: &mut CommandContext, address: &str) -> AppResult<()> {
        ctx.data_address = Some(address.to_string());
        Ok(())
    }

    /// `LOG` with the LogCollector address.
    async fn on_log(&mut self, ctx: &mut CommandContext, address: &str) -> AppResult<()> {
        ctx.connect_log(address).await
    }

    /// `SERVER`; roles with a listening server set `_SERVER`.
    async fn on_server(&mut self, _ctx: &mut CommandContext) -> AppResult<()> {
        Ok(())
    }

    /// `GETRUN`, after the dispatcher set `_RUN`.
    async fn on_get_run(&mut self, _ctx: &mut CommandContext) -> AppResult<()> {
        Ok(())
    }

    /// Any keyword not listed above.
    async fn on_unrecognised(&mut self, ctx: &mut CommandContext, keyword: &str, _param: &str) -> AppResult<()> {
        ctx.status.note(Level::Warn, format!("Unrecognised command '{keyword}'"));
        Ok(())
    }

    /// Called once per loop iteration.
    async fn on_idle(&mut self, _ctx: &mut CommandContext) -> AppResult<()> {
        Ok(())
    }
}

/// Connected command loop for one role.
pub struct CommandReceiver<H> {
    client: Box<dyn TransportClient>,
    handler: H,
    ctx: CommandContext,
    idle_interval: Duration,
    cancel: CancellationToken,
}

impl<H: CommandHandler> CommandReceiver<H> {
    /// Connects to RunControl and completes the CMD handshake.
    ///
    /// Only connection establishment is retried, up to
    /// `config.connect_retries` attempts; handshake failures are returned.
    pub async fn connect(
        role: &str,
        name: &str,
        handler: H,
        config: &CommandReceiverConfig,
    ) -> AppResult<Self> {
        let mut client =
            connect_with_retry(&config.run_control, config.connect_retries, config.retry_interval).await?;
        ClientHandshake::new(Channel::Cmd, role, name)
            .perform(client.as_mut(), config.greeting_timeout, config.ack_timeout)
            .await?;
        info!(role, name, "Connected to RunControl at {}", client.remote());
        Ok(Self {
            client,
            handler,
            ctx: CommandContext::new(role, name),
            idle_interval: config.idle_interval,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops the loop when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Role state.
    pub fn context(&self) -> &CommandContext {
        &self.ctx
    }

    /// Role handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Runs the loop until TERMINATE, disconnect or cancellation, returning
    /// the handler.
    pub async fn run(mut self) -> AppResult<H> {
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(role = %self.ctx.role, "Command loop cancelled");
                    break;
                }
                received = self.client.receive(self.idle_interval) => received,
            };
            match received {
                Ok(Some(packet)) => {
                    let line = CommandLine::decode(&packet);
                    let keep_going = self.dispatch(line).await;
                    if let Err(e) = self.client.send(&self.ctx.status.encode()).await {
                        warn!(role = %self.ctx.role, "Status reply failed, leaving command loop: {}", e);
                        break;
                    }
                    if !keep_going {
                        info!(role = %self.ctx.role, name = %self.ctx.name, "Terminated by RunControl");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(role = %self.ctx.role, "Lost connection to RunControl: {}", e);
                    break;
                }
            }
            if let Err(e) = self.handler.on_idle(&mut self.ctx).await {
                self.ctx.report(Level::Warn, &format!("Idle hook failed: {e}"));
            }
        }
        self.ctx.close().await;
        Ok(self.handler)
    }

    /// Runs the loop on a new task.
    pub fn spawn(self) -> JoinHandle<AppResult<H>>
    where
        H: 'static,
    {
        tokio::spawn(self.run())
    }

    /// Dispatches one command; `false` ends the loop.
    async fn dispatch(&mut self, line: CommandLine) -> bool {
        let keyword = line.command.keyword().to_string();
        debug!(role = %self.ctx.role, command = %keyword, "Dispatching");
        let outcome = AssertUnwindSafe(invoke(&mut self.handler, &mut self.ctx, &line))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.ctx.fail(format!("{keyword} failed: {e}")),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                let err = DaqError::HandlerPanic(keyword.clone());
                self.ctx.fail(format!("{err}: {detail}"));
            }
        }
        line.command != Command::Terminate
    }
}

async fn invoke<H: CommandHandler>(handler: &mut H, ctx: &mut CommandContext, line: &CommandLine) -> AppResult<()> {
    match &line.command {
        Command::Clear => {
            if ctx.status.state == State::Running {
                handler.on_stop_run(ctx).await?;
            }
            handler.on_clear(ctx).await?;
            ctx.status.note(Level::None, "");
            Ok(())
        }
        Command::Init => {
            let section = scoped_config(ctx, &line.param)?;
            handler.on_initialise(ctx, section).await
        }
        Command::Config => {
            let section = scoped_config(ctx, &line.param)?;
            handler.on_configure(ctx, section).await
        }
        Command::Prepare => {
            let run = parse_run(&line.param)?;
            handler.on_prepare(ctx, run).await
        }
        Command::Start => {
            let run = parse_run(&line.param)?;
            ctx.run_number = run;
            handler.on_start_run(ctx, run).await
        }
        Command::Stop => {
            if ctx.status.state != State::Running {
                let msg = DaqError::state("STOP", ctx.status.state).to_string();
                ctx.report(Level::Warn, &msg);
                ctx.status.note(Level::Warn, msg);
                return Ok(());
            }
            handler.on_stop_run(ctx).await
        }
        Command::Terminate => handler.on_terminate(ctx).await,
        Command::Reset => handler.on_reset(ctx).await,
        Command::Status => handler.on_status(ctx).await,
        Command::Data => handler.on_data(ctx, &line.param).await,
        Command::Log => handler.on_log(ctx, &line.param).await,
        Command::Server => handler.on_server(ctx).await,
        Command::GetRun => {
            ctx.status.set_tag(TAG_RUN, ctx.run_number);
            handler.on_get_run(ctx).await
        }
        Command::Unrecognised(keyword) => handler.on_unrecognised(ctx, keyword, &line.param).await,
    }
}

fn scoped_config(ctx: &mut CommandContext, text: &str) -> AppResult<ConfigSection> {
    let config = Configuration::parse(text)?;
    let section = config.section(&ctx.role, &ctx.name);
    ctx.config = config;
    Ok(section)
}

fn parse_run(param: &str) -> AppResult<u32> {
    param
        .trim()
        .parse()
        .map_err(|_| DaqError::Protocol(format!("invalid run number '{param}'")))
}

/// Connects to `address`, retrying connection failures.
pub(crate) async fn connect_with_retry(
    address: &str,
    attempts: u32,
    interval: Duration,
) -> AppResult<Box<dyn TransportClient>> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match transport::connect(address).await {
            Ok(client) => return Ok(client),
            Err(e) if attempt < attempts && matches!(e, DaqError::Connection(_)) => {
                warn!("Connecting to {} failed (attempt {}/{}): {}", address, attempt, attempts, e);
                attempt += 1;
                tokio::time::sleep(interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}
