//! Producer roles.
//!
//! [`Producer`] adapts a [`ProducerHandler`] onto the command dispatcher. It
//! owns the DataSender: `DATA` from RunControl (re)connects it, `TERMINATE`
//! closes it. The adapter performs every state transition, so a handler only
//! deals with its hardware or simulation.
//!
//! [`ExampleProducer`] is a simulated source: a BORE at start, `RawEvent`s
//! with random payload at a configured rate, an EORE at stop.

use crate::command_receiver::{CommandContext, CommandHandler};
use crate::data_sender::DataSender;
use crate::error::{AppResult, DaqError};
use crate::event::Event;
use crate::queue::OverflowWarning;
use crate::run_config::ConfigSection;
use crate::status::{Level, State};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cloneable handle for sending events to the current DataCollector.
#[derive(Clone, Default)]
pub struct ProducerContext {
    sender: Arc<RwLock<Option<Arc<DataSender>>>>,
}

impl std::fmt::Debug for ProducerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerContext")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ProducerContext {
    /// Queues `ev` for the DataCollector.
    pub fn send_event(&self, ev: &Event) -> AppResult<Option<OverflowWarning>> {
        match self.sender.read().as_ref() {
            Some(sender) => sender.send_event(ev),
            None => Err(DaqError::Connection("no DataCollector connected".to_string())),
        }
    }

    /// Whether a DataSender is connected.
    pub fn is_connected(&self) -> bool {
        self.sender.read().is_some()
    }

    fn replace(&self, sender: Option<DataSender>) -> Option<Arc<DataSender>> {
        std::mem::replace(&mut *self.sender.write(), sender.map(Arc::new))
    }
}

/// Producer callbacks. The adapter sets the resulting state after each one
/// succeeds.
#[async_trait]
pub trait ProducerHandler: Send {
    /// `INIT`, before entering `UNCONF`.
    async fn on_initialise(&mut self, _ctx: &mut CommandContext, _config: ConfigSection) -> AppResult<()> {
        Ok(())
    }

    /// `CONFIG`, before entering `CONF`.
    async fn on_configure(&mut self, ctx: &mut CommandContext, config: ConfigSection) -> AppResult<()>;

    /// `START`, before entering `RUNNING`. Send the BORE here.
    async fn on_start_run(&mut self, ctx: &mut CommandContext, data: &ProducerContext, run: u32) -> AppResult<()>;

    /// `STOP`, before returning to `CONF`. Send the EORE here.
    async fn on_stop_run(&mut self, ctx: &mut CommandContext, data: &ProducerContext) -> AppResult<()>;

    /// `TERMINATE`, before the DataSender is closed.
    async fn on_terminate(&mut self, _ctx: &mut CommandContext) -> AppResult<()> {
        Ok(())
    }

    /// `RESET`, before entering `UNINIT`.
    async fn on_reset(&mut self, _ctx: &mut CommandContext) -> AppResult<()> {
        Ok(())
    }
}

/// Command-handler adapter for a [`ProducerHandler`].
#[derive(Debug)]
pub struct Producer<H> {
    handler: H,
    data: ProducerContext,
}

impl<H: ProducerHandler> Producer<H> {
    /// Wraps `handler`.
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            data: ProducerContext::default(),
        }
    }

    /// Wrapped handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Handle used to send events.
    pub fn data(&self) -> &ProducerContext {
        &self.data
    }

    async fn close_sender(&mut self) {
        if let Some(old) = self.data.replace(None) {
            match Arc::try_unwrap(old) {
                Ok(sender) => sender.close().await,
                Err(_) => debug!("DataSender still shared, leaving it to drain on drop"),
            }
        }
    }
}

#[async_trait]
impl<H: ProducerHandler> CommandHandler for Producer<H> {
    async fn on_initialise(&mut self, ctx: &mut CommandContext, config: ConfigSection) -> AppResult<()> {
        self.handler.on_initialise(ctx, config).await?;
        ctx.status.set(State::Unconf, "Initialised");
        Ok(())
    }

    async fn on_configure(&mut self, ctx: &mut CommandContext, config: ConfigSection) -> AppResult<()> {
        self.handler.on_configure(ctx, config).await?;
        ctx.status.set(State::Conf, "Configured");
        Ok(())
    }

    async fn on_start_run(&mut self, ctx: &mut CommandContext, run: u32) -> AppResult<()> {
        ctx.require_state("START", State::Conf)?;
        if !self.data.is_connected() {
            ctx.report(Level::Warn, "Starting without a DataCollector, events will be lost");
        }
        self.handler.on_start_run(ctx, &self.data, run).await?;
        ctx.status.set(State::Running, format!("Running run {run}"));
        Ok(())
    }

    async fn on_stop_run(&mut self, ctx: &mut CommandContext) -> AppResult<()> {
        self.handler.on_stop_run(ctx, &self.data).await?;
        ctx.status.set(State::Conf, format!("Stopped run {}", ctx.run_number));
        Ok(())
    }

    async fn on_terminate(&mut self, ctx: &mut CommandContext) -> AppResult<()> {
        self.handler.on_terminate(ctx).await?;
        self.close_sender().await;
        Ok(())
    }

    async fn on_reset(&mut self, ctx: &mut CommandContext) -> AppResult<()> {
        self.handler.on_reset(ctx).await?;
        ctx.status.set(State::Uninit, "Reset");
        Ok(())
    }

    async fn on_data(&mut self, ctx: &mut CommandContext, address: &str) -> AppResult<()> {
        self.close_sender().await;
        let sender = DataSender::connect(address, ctx.role(), ctx.name()).await?;
        info!("Sending data to {}", sender.remote());
        self.data.replace(Some(sender));
        ctx.data_address = Some(address.to_string());
        Ok(())
    }
}

/// Simulated producer emitting random payloads.
#[derive(Debug)]
pub struct ExampleProducer {
    stream_id: u32,
    event_rate: f64,
    payload_bytes: usize,
    readout: Option<(CancellationToken, JoinHandle<u32>)>,
}

impl Default for ExampleProducer {
    fn default() -> Self {
        Self {
            stream_id: 0,
            event_rate: 10.0,
            payload_bytes: 64,
            readout: None,
        }
    }
}

impl ExampleProducer {
    /// Producer with default rate and payload size.
    pub fn new() -> Self {
        Self::default()
    }

    async fn readout(
        data: ProducerContext,
        cancel: CancellationToken,
        stream_id: u32,
        run: u32,
        period: Duration,
        payload_bytes: usize,
    ) -> u32 {
        let mut rng = StdRng::from_entropy();
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        let mut last = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let number = last + 1;
            let mut payload = vec![0u8; payload_bytes];
            rng.fill(&mut payload[..]);
            let mut ev = Event::raw("Example", stream_id, run, number);
            ev.set_trigger(number);
            ev.add_block(0, payload);
            if let Err(e) = data.send_event(&ev) {
                warn!(run, number, "Event not sent: {}", e);
            }
            last = number;
        }
        debug!(run, events = last, "Readout stopped");
        last
    }
}

#[async_trait]
impl ProducerHandler for ExampleProducer {
    async fn on_configure(&mut self, _ctx: &mut CommandContext, config: ConfigSection) -> AppResult<()> {
        let rate: f64 = config.get("EventRate", self.event_rate);
        if !rate.is_finite() || rate <= 0.0 {
            return Err(DaqError::Configuration(format!("EventRate must be positive, got {rate}")));
        }
        self.event_rate = rate;
        self.payload_bytes = config.get("PayloadBytes", self.payload_bytes);
        self.stream_id = config.get("StreamId", self.stream_id);
        info!(rate, payload = self.payload_bytes, "ExampleProducer configured");
        Ok(())
    }

    async fn on_start_run(&mut self, _ctx: &mut CommandContext, data: &ProducerContext, run: u32) -> AppResult<()> {
        let mut bore = Event::bore("Example", self.stream_id, run);
        bore.set_tag("EventRate", self.event_rate);
        bore.set_tag("PayloadBytes", self.payload_bytes);
        if data.is_connected() {
            data.send_event(&bore)?;
        }

        let cancel = CancellationToken::new();
        let period = Duration::from_secs_f64(1.0 / self.event_rate);
        let task = tokio::spawn(Self::readout(
            data.clone(),
            cancel.clone(),
            self.stream_id,
            run,
            period,
            self.payload_bytes,
        ));
        self.readout = Some((cancel, task));
        Ok(())
    }

    async fn on_stop_run(&mut self, ctx: &mut CommandContext, data: &ProducerContext) -> AppResult<()> {
        let last = match self.readout.take() {
            Some((cancel, task)) => {
                cancel.cancel();
                task.await.map_err(|e| DaqError::Connection(format!("readout task failed: {e}")))?
            }
            None => 0,
        };
        if data.is_connected() {
            data.send_event(&Event::eore("Example", self.stream_id, ctx.run_number, last + 1))?;
        }
        ctx.status.set_tag("EVENT", last);
        Ok(())
    }

    async fn on_terminate(&mut self, _ctx: &mut CommandContext) -> AppResult<()> {
        if let Some((cancel, task)) = self.readout.take() {
            cancel.cancel();
            let _ = task.await;
        }
        Ok(())
    }

    async fn on_reset(&mut self, ctx: &mut CommandContext) -> AppResult<()> {
        self.on_terminate(ctx).await
    }
}
