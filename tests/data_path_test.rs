//! End-to-end tests of the data path: producers, DataCollector, writer.

use async_trait::async_trait;
use rust_eudaq::command_receiver::{CommandContext, CommandReceiver};
use rust_eudaq::config::{CommandReceiverConfig, DataCollectorConfig, RunControlConfig};
use rust_eudaq::data_collector::DataCollector;
use rust_eudaq::event::{Event, EventRegistry};
use rust_eudaq::log::LogCollector;
use rust_eudaq::producer::{Producer, ProducerContext, ProducerHandler};
use rust_eudaq::run_config::{ConfigSection, Configuration};
use rust_eudaq::run_control::RunControl;
use rust_eudaq::status::State;
use rust_eudaq::writer::{SharedStore, WriterRegistry};
use rust_eudaq::AppResult;
use std::sync::Arc;
use std::time::Duration;

/// Sends BORE plus five data events at start and the EORE at stop.
struct ScriptedProducer {
    stream: u32,
}

#[async_trait]
impl ProducerHandler for ScriptedProducer {
    async fn on_configure(&mut self, _ctx: &mut CommandContext, _config: ConfigSection) -> AppResult<()> {
        Ok(())
    }

    async fn on_start_run(&mut self, _ctx: &mut CommandContext, data: &ProducerContext, run: u32) -> AppResult<()> {
        data.send_event(&Event::bore("Scripted", self.stream, run))?;
        for n in 1..=5 {
            let mut ev = Event::raw("Scripted", self.stream, run, n);
            ev.add_block(0, vec![self.stream as u8; 16]);
            data.send_event(&ev)?;
        }
        Ok(())
    }

    async fn on_stop_run(&mut self, ctx: &mut CommandContext, data: &ProducerContext) -> AppResult<()> {
        data.send_event(&Event::eore("Scripted", self.stream, ctx.run_number, 6))?;
        Ok(())
    }
}

const RUN_CONFIG: &str = r#"
[DataCollector]
FileType = "memory"
SyncAlgorithm = "index"
"#;

#[tokio::test]
async fn test_three_producers_seven_composites() {
    let rc = RunControl::listen(RunControlConfig {
        listen: "tcp://127.0.0.1:0".to_string(),
        terminate_grace: Duration::from_millis(50),
        ..RunControlConfig::default()
    })
    .await
    .unwrap();
    let config = CommandReceiverConfig {
        run_control: rc.address(),
        idle_interval: Duration::from_millis(10),
        ..CommandReceiverConfig::default()
    };

    let store = SharedStore::default();
    let mut writers = WriterRegistry::with_defaults();
    writers.register_memory(Arc::clone(&store));
    let collector = DataCollector::new(
        DataCollectorConfig {
            listen: "tcp://127.0.0.1:0".to_string(),
            stop_drain_timeout: Duration::from_secs(5),
            ..DataCollectorConfig::default()
        },
        Arc::new(EventRegistry::with_defaults()),
        Arc::new(writers),
    )
    .await
    .unwrap();
    let collector = CommandReceiver::connect("DataCollector", "", collector, &config)
        .await
        .unwrap()
        .spawn();
    rc.wait_for_peers(1, Duration::from_secs(5)).await.unwrap();

    let mut producers = Vec::new();
    for stream in 0..3 {
        let receiver = CommandReceiver::connect(
            "Producer",
            &format!("p{stream}"),
            Producer::new(ScriptedProducer { stream }),
            &config,
        )
        .await
        .unwrap();
        producers.push(receiver.spawn());
    }
    rc.wait_for_peers(4, Duration::from_secs(5)).await.unwrap();

    let run_config = Configuration::parse(RUN_CONFIG).unwrap();
    assert!(rc.initialise(&run_config).await.is_empty());
    assert!(rc.configure(&run_config).await.is_empty());

    let (run, failures) = rc.start_run(Some(7)).await;
    assert_eq!(run, 7);
    assert!(failures.is_empty(), "{failures:?}");

    // STOP on the DataCollector returns only after every composite is written.
    assert!(rc.stop_run().await.is_empty());
    {
        let store = store.lock();
        assert_eq!(store.runs, vec![7]);
        assert_eq!(store.events.len(), 7);
        assert!(store.events[0].is_bore());
        assert!(store.events[6].is_eore());
        for (i, composite) in store.events.iter().enumerate() {
            assert_eq!(composite.event_number, i as u32);
            assert_eq!(composite.run_number, 7);
            assert_eq!(composite.sub_events.len(), 3);
        }
    }

    let status = rc.poll_status().await;
    let dc = status.iter().find(|p| p.role == "DataCollector").unwrap();
    assert_eq!(dc.state(), State::Conf);
    assert_eq!(dc.status.as_ref().and_then(|s| s.tag("EVENT")), Some("7"));

    rc.terminate().await;
    collector.await.unwrap().unwrap().shutdown().await;
    for producer in producers {
        producer.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_failures_reach_log_collector() {
    let rc = RunControl::listen(RunControlConfig {
        listen: "tcp://127.0.0.1:0".to_string(),
        terminate_grace: Duration::from_millis(50),
        ..RunControlConfig::default()
    })
    .await
    .unwrap();
    let config = CommandReceiverConfig {
        run_control: rc.address(),
        idle_interval: Duration::from_millis(10),
        ..CommandReceiverConfig::default()
    };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daq.log");

    let logs = LogCollector::listen("tcp://127.0.0.1:0", Some(path.clone())).await.unwrap();
    let logs = CommandReceiver::connect("LogCollector", "", logs, &config)
        .await
        .unwrap()
        .spawn();
    rc.wait_for_peers(1, Duration::from_secs(5)).await.unwrap();

    // An example producer rejects a non-positive rate.
    let producer = CommandReceiver::connect(
        "Producer",
        "sim",
        Producer::new(rust_eudaq::producer::ExampleProducer::new()),
        &config,
    )
    .await
    .unwrap()
    .spawn();
    rc.wait_for_peers(2, Duration::from_secs(5)).await.unwrap();

    let run_config = Configuration::parse("[Producer.sim]\nEventRate = -1.0\n").unwrap();
    assert!(rc.initialise(&run_config).await.is_empty());
    let failures = rc.configure(&run_config).await;
    assert_eq!(failures.len(), 1);

    let mut text = String::new();
    for _ in 0..100 {
        text = std::fs::read_to_string(&path).unwrap_or_default();
        if text.contains("Producer.sim") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(text.contains("Producer.sim"), "{text}");
    assert!(text.contains("EventRate must be positive"), "{text}");

    rc.terminate().await;
    producer.await.unwrap().unwrap();
    logs.await.unwrap().unwrap().shutdown().await;
}
