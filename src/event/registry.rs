//! Type-id keyed factory for event variants.
//!
//! Built once at startup and passed by `Arc` to every component that decodes
//! events. Cloning an event goes through this registry too: serialize, then
//! decode, so a clone is bit-identical for every registered variant.

use super::{type_id, Event, EventBody, TAG_BASE, TAG_DETECTOR, TAG_RAW, TAG_SYNC, TAG_TRIGGER};
use crate::error::{AppResult, DaqError};
use crate::serialize::Deserializer;
use bytes::Bytes;
use std::collections::HashMap;

/// Constructs one variant from a packet positioned at its type id.
pub type EventDecoder = Box<dyn Fn(&mut Deserializer, &EventRegistry) -> AppResult<Event> + Send + Sync>;

struct Entry {
    tag: String,
    decoder: EventDecoder,
}

/// Factory table mapping type ids to constructors.
pub struct EventRegistry {
    entries: HashMap<u32, Entry>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<&str> = self.entries.values().map(|e| e.tag.as_str()).collect();
        tags.sort_unstable();
        f.debug_struct("EventRegistry").field("tags", &tags).finish()
    }
}

impl EventRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registry with every built-in variant.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for tag in [TAG_BASE, TAG_TRIGGER, TAG_SYNC, TAG_DETECTOR] {
            registry.register_plain(tag);
        }
        registry.register(
            TAG_RAW,
            Box::new(|de: &mut Deserializer, reg: &EventRegistry| {
                Event::deserialize_with(de, reg, Event::read_raw_body)
            }),
        );
        registry
    }

    /// Registers a decoder for `tag`, replacing any previous one.
    pub fn register(&mut self, tag: &str, decoder: EventDecoder) {
        self.entries.insert(
            type_id(tag),
            Entry {
                tag: tag.to_string(),
                decoder,
            },
        );
    }

    /// Registers `tag` as a variant without a body.
    pub fn register_plain(&mut self, tag: &str) {
        self.register(
            tag,
            Box::new(|de: &mut Deserializer, reg: &EventRegistry| {
                Event::deserialize_with(de, reg, |_| Ok(EventBody::Empty))
            }),
        );
    }

    /// Whether `type_id` has a constructor.
    pub fn is_registered(&self, type_id: u32) -> bool {
        self.entries.contains_key(&type_id)
    }

    /// Tag registered for `type_id`.
    pub fn tag_of(&self, type_id: u32) -> Option<&str> {
        self.entries.get(&type_id).map(|e| e.tag.as_str())
    }

    /// Constructs the variant registered for `type_id` from `de`.
    pub fn create(&self, type_id: u32, de: &mut Deserializer) -> AppResult<Event> {
        let entry = self
            .entries
            .get(&type_id)
            .ok_or(DaqError::UnknownType { type_id })?;
        (entry.decoder)(de, self)
    }

    /// Constructs the next event in `de`, dispatching on its type id.
    pub fn deserialize(&self, de: &mut Deserializer) -> AppResult<Event> {
        let type_id = de.peek_u32()?;
        self.create(type_id, de)
    }

    /// Decodes one packet holding exactly one event.
    pub fn decode(&self, packet: impl Into<Bytes>) -> AppResult<Event> {
        let mut de = Deserializer::new(packet);
        let ev = self.deserialize(&mut de)?;
        if de.remaining() > 0 {
            return Err(DaqError::Serialization(format!(
                "{} trailing bytes after event",
                de.remaining()
            )));
        }
        Ok(ev)
    }

    /// Duplicates an event by serializing and decoding it.
    pub fn clone_event(&self, ev: &Event) -> AppResult<Event> {
        self.decode(ev.to_bytes())
    }
}
