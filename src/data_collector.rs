//! DataCollector role: DataReceiver, EventSynchronizer and a FileWriter
//! behind a CommandReceiver.
//!
//! A forwarding task drains the receive queue into the synchronizer and
//! hands every composite it produces to the run's writer. Writer failures
//! are never retried; the writer is dropped and the role reports `ERROR` on
//! its next reply.
//!
//! `STOP` is a barrier: the reply is sent only once every stream delivered
//! its EORE (or left), bounded by `stop_drain_timeout`, and every composite
//! has been written.

use crate::command_receiver::{CommandContext, CommandHandler};
use crate::config::DataCollectorConfig;
use crate::data_receiver::{DataReceiver, ReceivedItem};
use crate::error::AppResult;
use crate::event::EventRegistry;
use crate::queue::BoundedQueue;
use crate::run_config::ConfigSection;
use crate::status::{Level, State, TAG_SERVER};
use crate::sync::{policy_by_name, EventSynchronizer, SyncState};
use crate::writer::{FileWriter, WriterRegistry};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Core {
    sync: EventSynchronizer,
    writer: Option<Box<dyn FileWriter>>,
    written: u32,
    file_bytes: u64,
    failure: Option<String>,
}

impl Core {
    fn apply(&mut self, item: ReceivedItem) {
        match item {
            ReceivedItem::Connected { stream, .. } => self.sync.add_stream(stream),
            ReceivedItem::Event { stream, event } => self.sync.push(event, stream),
            ReceivedItem::Disconnected { stream } => self.sync.remove_stream(stream),
        }
    }

    /// Writes every ready composite; keeps them queued while no writer is open.
    fn flush(&mut self) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let mut failed = None;
        while let Some(ev) = self.sync.pop_output() {
            if let Err(e) = writer.write_event(&ev) {
                failed = Some(format!("Writing composite {} failed: {e}", ev.event_number));
                break;
            }
            self.written += 1;
        }
        self.file_bytes = writer.file_bytes();
        if let Some(message) = failed {
            error!("{}", message);
            self.failure = Some(message);
            self.writer = None;
        }
    }
}

/// Merging and persisting sink for one run.
pub struct DataCollector {
    settings: DataCollectorConfig,
    receiver: DataReceiver,
    writers: Arc<WriterRegistry>,
    file_type: String,
    core: Arc<Mutex<Core>>,
    forward: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DataCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock();
        f.debug_struct("DataCollector")
            .field("address", &self.receiver.address())
            .field("file_type", &self.file_type)
            .field("sync", &core.sync)
            .field("written", &core.written)
            .finish()
    }
}

impl DataCollector {
    /// Binds the DATA server and starts forwarding.
    pub async fn new(
        settings: DataCollectorConfig,
        events: Arc<EventRegistry>,
        writers: Arc<WriterRegistry>,
    ) -> AppResult<Self> {
        let policy = policy_by_name(&settings.sync_algorithm, 0)?;
        let receiver = DataReceiver::with_capacity(&settings.listen, events, settings.queue_capacity).await?;
        let core = Arc::new(Mutex::new(Core {
            sync: EventSynchronizer::new(policy),
            writer: None,
            written: 0,
            file_bytes: 0,
            failure: None,
        }));
        let forward = tokio::spawn(forward(receiver.queue(), Arc::clone(&core)));
        Ok(Self {
            file_type: settings.file_type.clone(),
            settings,
            receiver,
            writers,
            core,
            forward: Some(forward),
        })
    }

    /// DATA address producers connect to.
    pub fn address(&self) -> String {
        self.receiver.address()
    }

    /// Composites written in the current run.
    pub fn events_written(&self) -> u32 {
        self.core.lock().written
    }

    /// Bytes reported by the current writer.
    pub fn file_bytes(&self) -> u64 {
        self.core.lock().file_bytes
    }

    /// Synchronizer phase.
    pub fn sync_state(&self) -> SyncState {
        self.core.lock().sync.state()
    }

    /// Number of producer streams known to the synchronizer.
    pub fn stream_count(&self) -> usize {
        self.core.lock().sync.stream_count()
    }

    /// Closes the DATA server and joins the forwarding task.
    pub async fn shutdown(mut self) {
        self.receiver.shutdown().await;
        if let Some(task) = self.forward.take() {
            if let Err(e) = task.await {
                error!("DataCollector forwarding task ended abnormally: {}", e);
            }
        }
    }

    /// Waits until every stream finished and the receive queue is empty.
    async fn wait_for_streams(&self) -> bool {
        let queue = self.receiver.queue();
        let finished = || queue.is_empty() && self.core.lock().sync.all_streams_finished();
        let wait = async {
            let mut ticker = tokio::time::interval(Duration::from_millis(20));
            while !finished() {
                ticker.tick().await;
            }
        };
        tokio::time::timeout(self.settings.stop_drain_timeout, wait).await.is_ok()
    }

    fn check_writer(&self, ctx: &mut CommandContext) {
        let failure = self.core.lock().failure.take();
        if let Some(message) = failure {
            ctx.report(Level::Error, &message);
            ctx.status.set(State::Error, message);
        }
    }

    fn set_counters(&self, ctx: &mut CommandContext) {
        let core = self.core.lock();
        ctx.status.set_tag("EVENT", core.written);
        ctx.status.set_tag("RUN", ctx.run_number);
        ctx.status.set_tag("FILEBYTES", core.file_bytes);
    }
}

async fn forward(queue: Arc<BoundedQueue<ReceivedItem>>, core: Arc<Mutex<Core>>) {
    while let Some(item) = queue.pop().await {
        let mut state = core.lock();
        state.apply(item);
        state.flush();
    }
    debug!("DataCollector forwarding stopped");
}

#[async_trait]
impl CommandHandler for DataCollector {
    async fn on_configure(&mut self, ctx: &mut CommandContext, config: ConfigSection) -> AppResult<()> {
        let algorithm: String = config.get("SyncAlgorithm", self.settings.sync_algorithm.clone());
        let tolerance: u64 = config.get("SyncTolerance", 0);
        let file_type: String = config.get("FileType", self.settings.file_type.clone());
        let policy = policy_by_name(&algorithm, tolerance)?;
        // Validate the writer name now rather than at START.
        self.writers.create(&file_type)?;

        self.core.lock().sync.set_policy(policy);
        self.file_type = file_type;
        info!(sync = %algorithm, file_type = %self.file_type, "DataCollector configured");
        ctx.status.set(State::Conf, "Configured");
        Ok(())
    }

    async fn on_start_run(&mut self, ctx: &mut CommandContext, run: u32) -> AppResult<()> {
        ctx.require_state("START", State::Conf)?;
        let mut writer = self.writers.create(&self.file_type)?;
        writer.start_run(run)?;
        {
            let mut core = self.core.lock();
            core.sync.set_run_number(run);
            core.writer = Some(writer);
            core.written = 0;
            core.file_bytes = 0;
            core.failure = None;
            core.flush();
        }
        info!(run, "DataCollector started run");
        ctx.status.set(State::Running, format!("Running run {run}"));
        Ok(())
    }

    async fn on_stop_run(&mut self, ctx: &mut CommandContext) -> AppResult<()> {
        if !self.wait_for_streams().await {
            warn!(
                timeout = ?self.settings.stop_drain_timeout,
                "Not every stream ended its run, flushing what was received"
            );
        }
        let written = {
            let queue = self.receiver.queue();
            let mut core = self.core.lock();
            while let Some(item) = queue.try_pop() {
                core.apply(item);
            }
            core.sync.begin_drain();
            core.flush();
            let written = core.written;
            core.sync.reset();
            core.writer = None;
            written
        };
        self.check_writer(ctx);
        self.set_counters(ctx);
        info!(run = ctx.run_number, written, "DataCollector stopped run");
        if ctx.state() != State::Error {
            ctx.status.set(State::Conf, format!("Stopped run {} after {written} events", ctx.run_number));
        }
        Ok(())
    }

    async fn on_reset(&mut self, ctx: &mut CommandContext) -> AppResult<()> {
        {
            let mut core = self.core.lock();
            core.sync.reset();
            core.writer = None;
            core.failure = None;
        }
        ctx.status.set(State::Uninit, "Reset");
        Ok(())
    }

    async fn on_status(&mut self, ctx: &mut CommandContext) -> AppResult<()> {
        self.check_writer(ctx);
        self.set_counters(ctx);
        Ok(())
    }

    async fn on_server(&mut self, ctx: &mut CommandContext) -> AppResult<()> {
        ctx.status.set_tag(TAG_SERVER, self.receiver.address());
        Ok(())
    }

    async fn on_idle(&mut self, ctx: &mut CommandContext) -> AppResult<()> {
        self.check_writer(ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_sender::DataSender;
    use crate::event::Event;
    use crate::run_config::Configuration;
    use crate::writer::SharedStore;

    struct FailingWriter;

    impl FileWriter for FailingWriter {
        fn start_run(&mut self, _run: u32) -> AppResult<()> {
            Ok(())
        }

        fn write_event(&mut self, _ev: &Arc<Event>) -> AppResult<()> {
            Err(crate::error::DaqError::Writer("disk full".into()))
        }

        fn file_bytes(&self) -> u64 {
            0
        }
    }

    fn settings() -> DataCollectorConfig {
        DataCollectorConfig {
            listen: "tcp://127.0.0.1:0".to_string(),
            stop_drain_timeout: Duration::from_secs(5),
            ..DataCollectorConfig::default()
        }
    }

    async fn collector(store: &SharedStore) -> DataCollector {
        let mut writers = WriterRegistry::with_defaults();
        writers.register_memory(Arc::clone(store));
        writers.register("failing", Box::new(|| Box::new(FailingWriter) as Box<dyn FileWriter>));
        DataCollector::new(settings(), Arc::new(EventRegistry::with_defaults()), Arc::new(writers))
            .await
            .unwrap()
    }

    fn section(text: &str) -> ConfigSection {
        Configuration::parse(text).unwrap().section("DataCollector", "")
    }

    async fn wait_for_streams(dc: &DataCollector, count: usize) {
        for _ in 0..100 {
            if dc.stream_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("streams never connected");
    }

    #[tokio::test]
    async fn test_stop_returns_after_all_composites_written() {
        let store = SharedStore::default();
        let mut dc = collector(&store).await;
        let mut ctx = CommandContext::new("DataCollector", "");
        ctx.status.set(State::Unconf, "");
        dc.on_configure(&mut ctx, section("[DataCollector]\nFileType = \"memory\"\n"))
            .await
            .unwrap();

        let mut senders = Vec::new();
        for p in 0..3 {
            senders.push(DataSender::connect(&dc.address(), "Producer", &format!("p{p}")).await.unwrap());
        }
        wait_for_streams(&dc, 3).await;

        ctx.run_number = 7;
        dc.on_start_run(&mut ctx, 7).await.unwrap();
        assert_eq!(ctx.state(), State::Running);
        for (p, sender) in senders.iter().enumerate() {
            let p = p as u32;
            sender.send_event(&Event::bore("Test", p, 7)).unwrap();
            for n in 1..=5 {
                sender.send_event(&Event::raw("Test", p, 7, n)).unwrap();
            }
            sender.send_event(&Event::eore("Test", p, 7, 6)).unwrap();
        }

        dc.on_stop_run(&mut ctx).await.unwrap();
        {
            let store = store.lock();
            assert_eq!(store.runs, vec![7]);
            assert_eq!(store.events.len(), 7);
            assert!(store.events[0].is_bore());
            assert!(store.events[6].is_eore());
            assert!(store.events.iter().all(|e| e.sub_events.len() == 3));
        }
        assert_eq!(ctx.state(), State::Conf);
        assert_eq!(ctx.status.tag("EVENT"), Some("7"));
        assert_eq!(dc.sync_state(), SyncState::CollectingBore);

        for sender in senders {
            sender.close().await;
        }
        dc.shutdown().await;
    }

    #[tokio::test]
    async fn test_writer_failure_reports_error() {
        let store = SharedStore::default();
        let mut dc = collector(&store).await;
        let mut ctx = CommandContext::new("DataCollector", "");
        ctx.status.set(State::Unconf, "");
        dc.on_configure(&mut ctx, section("[DataCollector]\nFileType = \"failing\"\n"))
            .await
            .unwrap();

        let sender = DataSender::connect(&dc.address(), "Producer", "p").await.unwrap();
        wait_for_streams(&dc, 1).await;
        dc.on_start_run(&mut ctx, 1).await.unwrap();
        sender.send_event(&Event::bore("Test", 0, 1)).unwrap();

        for _ in 0..100 {
            dc.on_status(&mut ctx).await.unwrap();
            if ctx.state() == State::Error {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(ctx.state(), State::Error);
        assert!(ctx.status.message.contains("disk full"));

        sender.close().await;
        dc.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_settings_rejected() {
        let store = SharedStore::default();
        let mut dc = collector(&store).await;
        let mut ctx = CommandContext::new("DataCollector", "");
        ctx.status.set(State::Unconf, "");
        assert!(dc
            .on_configure(&mut ctx, section("[DataCollector]\nSyncAlgorithm = \"magic\"\n"))
            .await
            .is_err());
        assert!(dc
            .on_configure(&mut ctx, section("[DataCollector]\nFileType = \"root\"\n"))
            .await
            .is_err());
        assert_eq!(ctx.state(), State::Unconf);

        dc.on_server(&mut ctx).await.unwrap();
        assert_eq!(ctx.status.tag(TAG_SERVER), Some(dc.address().as_str()));
        dc.shutdown().await;
    }
}
