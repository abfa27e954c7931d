//! FileWriter collaborators used by the DataCollector.
//!
//! Persistence formats live outside this crate. A writer only has to accept
//! a run number, then composites in order, and report how many bytes it has
//! written so far. Writers are looked up by name in a [`WriterRegistry`]
//! built at startup.

use crate::error::{AppResult, DaqError};
use crate::event::Event;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Sink for composite events.
pub trait FileWriter: Send {
    /// Called once before the first composite of `run`.
    fn start_run(&mut self, run: u32) -> AppResult<()>;

    /// Writes one composite.
    fn write_event(&mut self, ev: &Arc<Event>) -> AppResult<()>;

    /// Bytes written so far in the current run.
    fn file_bytes(&self) -> u64;
}

/// Discards composites, counting their serialized size.
#[derive(Debug, Default)]
pub struct NullWriter {
    bytes: u64,
}

impl FileWriter for NullWriter {
    fn start_run(&mut self, _run: u32) -> AppResult<()> {
        self.bytes = 0;
        Ok(())
    }

    fn write_event(&mut self, ev: &Arc<Event>) -> AppResult<()> {
        self.bytes += ev.to_bytes().len() as u64;
        Ok(())
    }

    fn file_bytes(&self) -> u64 {
        self.bytes
    }
}

/// Composites and run starts recorded by a [`MemoryWriter`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Run numbers passed to `start_run`, in order.
    pub runs: Vec<u32>,
    /// Every composite written.
    pub events: Vec<Arc<Event>>,
}

/// Shared handle onto a [`MemoryStore`].
pub type SharedStore = Arc<Mutex<MemoryStore>>;

/// Keeps composites in memory so they can be inspected afterwards.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    store: SharedStore,
    bytes: u64,
}

impl MemoryWriter {
    /// Writer appending to `store`.
    pub fn new(store: SharedStore) -> Self {
        Self { store, bytes: 0 }
    }

    /// Handle onto the recorded data.
    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.store)
    }
}

impl FileWriter for MemoryWriter {
    fn start_run(&mut self, run: u32) -> AppResult<()> {
        self.bytes = 0;
        self.store.lock().runs.push(run);
        Ok(())
    }

    fn write_event(&mut self, ev: &Arc<Event>) -> AppResult<()> {
        self.bytes += ev.to_bytes().len() as u64;
        self.store.lock().events.push(Arc::clone(ev));
        Ok(())
    }

    fn file_bytes(&self) -> u64 {
        self.bytes
    }
}

/// Builds a fresh writer for each run.
pub type WriterFactory = Box<dyn Fn() -> Box<dyn FileWriter> + Send + Sync>;

/// Name-keyed table of writer factories.
pub struct WriterRegistry {
    factories: BTreeMap<String, WriterFactory>,
}

impl std::fmt::Debug for WriterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterRegistry")
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for WriterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl WriterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with `null` and a `memory` writer backed by a fresh store.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("null", Box::new(|| Box::new(NullWriter::default()) as Box<dyn FileWriter>));
        registry.register_memory(SharedStore::default());
        registry
    }

    /// Registers `name`, replacing any previous factory.
    pub fn register(&mut self, name: &str, factory: WriterFactory) {
        self.factories.insert(name.to_ascii_lowercase(), factory);
    }

    /// Registers `memory` writing into `store`.
    pub fn register_memory(&mut self, store: SharedStore) {
        self.register(
            "memory",
            Box::new(move || Box::new(MemoryWriter::new(Arc::clone(&store))) as Box<dyn FileWriter>),
        );
    }

    /// Builds the writer registered as `name`.
    pub fn create(&self, name: &str) -> AppResult<Box<dyn FileWriter>> {
        let factory = self.factories.get(&name.to_ascii_lowercase()).ok_or_else(|| {
            DaqError::Configuration(format!(
                "unknown file writer '{name}', registered: {}",
                self.factories.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        Ok(factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_writer_counts_bytes() {
        let mut writer = NullWriter::default();
        writer.start_run(3).unwrap();
        let ev = Arc::new(Event::raw("Test", 0, 3, 1));
        writer.write_event(&ev).unwrap();
        assert_eq!(writer.file_bytes(), ev.to_bytes().len() as u64);
        writer.start_run(4).unwrap();
        assert_eq!(writer.file_bytes(), 0);
    }

    #[test]
    fn test_memory_writer_shares_store() {
        let store = SharedStore::default();
        let mut registry = WriterRegistry::new();
        registry.register_memory(Arc::clone(&store));

        let mut writer = registry.create("Memory").unwrap();
        writer.start_run(9).unwrap();
        writer.write_event(&Arc::new(Event::bore("Test", 1, 9))).unwrap();

        let store = store.lock();
        assert_eq!(store.runs, vec![9]);
        assert_eq!(store.events.len(), 1);
        assert!(store.events[0].is_bore());
    }

    #[test]
    fn test_unknown_writer() {
        let registry = WriterRegistry::with_defaults();
        let err = registry.create("root").err().unwrap();
        assert!(err.to_string().contains("null"));
        assert!(registry.create("null").is_ok());
    }
}
