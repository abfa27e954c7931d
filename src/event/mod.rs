//! Serializable events, their flags and the type-id factory.
//!
//! # Wire format
//!
//! All integers little-endian:
//!
//! ```text
//! u32 type_id | u32 version | u32 flags | u32 stream_id | u32 run | u32 event | u32 trigger
//! u64 ts_begin | u64 ts_end | string description | map tags
//! <variant body>
//! u32 sub_event_count | sub_event*      (each decoded through the registry)
//! ```
//!
//! The body depends on the variant registered for `type_id`: plain events
//! carry none, raw events carry `u32 n` followed by `n × (u32 id, bytes)`.
//!
//! Events are immutable once handed to a sender; everything downstream shares
//! them as `Arc<Event>`. Composite events reference their members the same way.

pub mod registry;

pub use registry::{EventDecoder, EventRegistry};

use crate::error::AppResult;
use crate::limits;
use crate::serialize::{Deserializer, Serializer};
use bitflags::bitflags;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Current event format version.
pub const EVENT_VERSION: u32 = 2;

/// Tag of the generic event variant.
pub const TAG_BASE: &str = "BASE";
/// Tag of trigger-only events.
pub const TAG_TRIGGER: &str = "TRIGGER";
/// Tag of timestamp-merged composites.
pub const TAG_SYNC: &str = "SYNC";
/// Tag of composite events built by the synchronizer.
pub const TAG_DETECTOR: &str = "DetectorEvent";
/// Tag of raw data block events.
pub const TAG_RAW: &str = "RawEvent";

/// Derives a wire type id from a short ASCII tag.
///
/// Hash evaluated from the last byte towards the first:
/// `h = 5381; h = h * 33 ^ byte`, wrapping at 32 bits.
pub const fn type_id(tag: &str) -> u32 {
    let bytes = tag.as_bytes();
    let mut h: u32 = 5381;
    let mut i = bytes.len();
    while i > 0 {
        i -= 1;
        h = h.wrapping_mul(33) ^ (bytes[i] as u32);
    }
    h
}

bitflags! {
    /// Event marker bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventFlags: u32 {
        /// Begin-of-run event.
        const BORE = 1;
        /// End-of-run event.
        const EORE = 2;
        /// Carries hit data.
        const HITS = 4;
        /// Fabricated to fill a gap.
        const FAKE = 8;
        /// Simulated data.
        const SIMU = 16;
        /// Current format generation.
        const EUDAQ2 = 32;
        /// Packetised payload.
        const PACKET = 64;
        /// Known to be corrupt.
        const BROKEN = 128;
        /// Status-only event.
        const STATUS = 256;
        /// Timestamps are valid.
        const TIME = 512;
        /// Trigger number is valid.
        const TRIG = 1024;
    }
}

/// One raw data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    /// Block identifier, usually a plane or channel.
    pub id: u32,
    /// Raw bytes.
    pub data: Bytes,
}

/// Variant-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventBody {
    /// No payload beyond the header.
    #[default]
    Empty,
    /// Ordered raw blocks.
    Raw(Vec<RawBlock>),
}

/// Unit of data interchange.
#[derive(Debug, PartialEq, Eq)]
pub struct Event {
    /// Variant dispatch key, see [`type_id`].
    pub type_id: u32,
    /// Format version.
    pub version: u32,
    /// Marker bits.
    pub flags: EventFlags,
    /// Originating producer instance.
    pub stream_id: u32,
    /// Run number.
    pub run_number: u32,
    /// Monotonic per stream within a run; 0 for BORE.
    pub event_number: u32,
    /// Trigger number, valid when `TRIG` is set.
    pub trigger_number: u32,
    /// Start of the covered time interval.
    pub ts_begin: u64,
    /// End of the covered time interval.
    pub ts_end: u64,
    /// Free-form description, e.g. the producer's data type.
    pub description: String,
    /// Tags; keys unique, last write wins.
    pub tags: BTreeMap<String, String>,
    /// Variant payload.
    pub body: EventBody,
    /// Members of a composite event.
    pub sub_events: Vec<Arc<Event>>,
}

impl Event {
    /// Creates an empty event of the variant named by `tag`.
    pub fn new(tag: &str) -> Self {
        Self {
            type_id: type_id(tag),
            version: EVENT_VERSION,
            flags: EventFlags::EUDAQ2,
            stream_id: 0,
            run_number: 0,
            event_number: 0,
            trigger_number: 0,
            ts_begin: 0,
            ts_end: 0,
            description: String::new(),
            tags: BTreeMap::new(),
            body: EventBody::Empty,
            sub_events: Vec::new(),
        }
    }

    /// Creates a raw data event; `description` names the producer's data type.
    pub fn raw(description: impl Into<String>, stream_id: u32, run_number: u32, event_number: u32) -> Self {
        let mut ev = Self::new(TAG_RAW);
        ev.description = description.into();
        ev.stream_id = stream_id;
        ev.run_number = run_number;
        ev.event_number = event_number;
        ev.body = EventBody::Raw(Vec::new());
        ev
    }

    /// Begin-of-run marker for one stream; always event number 0.
    pub fn bore(description: impl Into<String>, stream_id: u32, run_number: u32) -> Self {
        let mut ev = Self::raw(description, stream_id, run_number, 0);
        ev.flags |= EventFlags::BORE;
        ev
    }

    /// End-of-run marker for one stream.
    pub fn eore(description: impl Into<String>, stream_id: u32, run_number: u32, event_number: u32) -> Self {
        let mut ev = Self::raw(description, stream_id, run_number, event_number);
        ev.flags |= EventFlags::EORE;
        ev
    }

    /// Whether this is a begin-of-run marker.
    pub fn is_bore(&self) -> bool {
        self.flags.contains(EventFlags::BORE)
    }

    /// Whether this is an end-of-run marker.
    pub fn is_eore(&self) -> bool {
        self.flags.contains(EventFlags::EORE)
    }

    /// Sets the trigger number and the `TRIG` flag.
    pub fn set_trigger(&mut self, trigger: u32) {
        self.trigger_number = trigger;
        self.flags |= EventFlags::TRIG;
    }

    /// Sets the time interval and the `TIME` flag.
    pub fn set_timestamps(&mut self, begin: u64, end: u64) {
        self.ts_begin = begin;
        self.ts_end = end;
        self.flags |= EventFlags::TIME;
    }

    /// Sets one tag.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl ToString) {
        self.tags.insert(key.into(), value.to_string());
    }

    /// Looks up one tag.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Appends a raw block. Ignored, with a warning, on non-raw events.
    pub fn add_block(&mut self, id: u32, data: impl Into<Bytes>) {
        match &mut self.body {
            EventBody::Raw(blocks) => blocks.push(RawBlock { id, data: data.into() }),
            EventBody::Empty => warn!(type_id = self.type_id, "Raw block added to a non-raw event was ignored"),
        }
    }

    /// Raw blocks, empty for non-raw events.
    pub fn blocks(&self) -> &[RawBlock] {
        match &self.body {
            EventBody::Raw(blocks) => blocks,
            EventBody::Empty => &[],
        }
    }

    /// Adds a member to a composite event.
    pub fn add_sub_event(&mut self, ev: Arc<Event>) {
        self.sub_events.push(ev);
    }

    /// Writes this event and its members.
    pub fn serialize(&self, ser: &mut Serializer) {
        ser.put_u32(self.type_id);
        ser.put_u32(self.version);
        ser.put_u32(self.flags.bits());
        ser.put_u32(self.stream_id);
        ser.put_u32(self.run_number);
        ser.put_u32(self.event_number);
        ser.put_u32(self.trigger_number);
        ser.put_u64(self.ts_begin);
        ser.put_u64(self.ts_end);
        ser.put_str(&self.description);
        ser.put_map(&self.tags);
        if let EventBody::Raw(blocks) = &self.body {
            ser.put_u32(blocks.len() as u32);
            for block in blocks {
                ser.put_u32(block.id);
                ser.put_bytes(&block.data);
            }
        }
        ser.put_u32(self.sub_events.len() as u32);
        for sub in &self.sub_events {
            sub.serialize(ser);
        }
    }

    /// Serializes into a fresh packet.
    pub fn to_bytes(&self) -> Bytes {
        let mut ser = Serializer::new();
        self.serialize(&mut ser);
        ser.finish()
    }

    /// Reads the common header, the body via `body`, then members via `registry`.
    ///
    /// Used by registered decoders; the type id is consumed here.
    pub fn deserialize_with<F>(de: &mut Deserializer, registry: &EventRegistry, body: F) -> AppResult<Self>
    where
        F: FnOnce(&mut Deserializer) -> AppResult<EventBody>,
    {
        let type_id = de.get_u32()?;
        let version = de.get_u32()?;
        let flags = EventFlags::from_bits_retain(de.get_u32()?);
        let stream_id = de.get_u32()?;
        let run_number = de.get_u32()?;
        let event_number = de.get_u32()?;
        let trigger_number = de.get_u32()?;
        let ts_begin = de.get_u64()?;
        let ts_end = de.get_u64()?;
        let description = de.get_string()?;
        let tags = de.get_map()?;
        let body = body(de)?;
        let count = de.get_u32()?;
        let mut sub_events = Vec::with_capacity(count.min(1024) as usize);
        if count > 0 {
            de.enter_nested(limits::MAX_SUB_EVENT_DEPTH)?;
            for _ in 0..count {
                sub_events.push(Arc::new(registry.deserialize(de)?));
            }
            de.leave_nested();
        }
        Ok(Self {
            type_id,
            version,
            flags,
            stream_id,
            run_number,
            event_number,
            trigger_number,
            ts_begin,
            ts_end,
            description,
            tags,
            body,
            sub_events,
        })
    }

    /// Body reader for raw events.
    pub fn read_raw_body(de: &mut Deserializer) -> AppResult<EventBody> {
        let count = de.get_u32()?;
        let mut blocks = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let id = de.get_u32()?;
            let data = de.get_bytes()?;
            blocks.push(RawBlock { id, data });
        }
        Ok(EventBody::Raw(blocks))
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Event(type={:#010x}, stream={}, run={}, ev={}",
            self.type_id, self.stream_id, self.run_number, self.event_number
        )?;
        if self.is_bore() {
            write!(f, ", BORE")?;
        }
        if self.is_eore() {
            write!(f, ", EORE")?;
        }
        if !self.sub_events.is_empty() {
            write!(f, ", {} sub-events", self.sub_events.len())?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_id_hash() {
        assert_eq!(type_id(""), 5381);
        // h("A") = 5381 * 33 ^ 'A'
        assert_eq!(type_id("A"), (5381u32 * 33) ^ 65);
        // Evaluated from the end: h("AB") = (h("B") * 33) ^ 'A'
        let hb = (5381u32 * 33) ^ 66;
        assert_eq!(type_id("AB"), hb.wrapping_mul(33) ^ 65);
        assert_ne!(type_id(TAG_RAW), type_id(TAG_DETECTOR));
    }

    #[test]
    fn test_markers() {
        let bore = Event::bore("Tlu", 3, 7);
        assert!(bore.is_bore());
        assert!(!bore.is_eore());
        assert_eq!(bore.event_number, 0);
        assert_eq!(bore.type_id, type_id(TAG_RAW));

        let eore = Event::eore("Tlu", 3, 7, 6);
        assert!(eore.is_eore());
        assert_eq!(eore.event_number, 6);
    }

    #[test]
    fn test_tags_last_write_wins() {
        let mut ev = Event::new(TAG_BASE);
        ev.set_tag("A", 1);
        ev.set_tag("A", "two");
        assert_eq!(ev.tag("A"), Some("two"));
        assert_eq!(ev.tags.len(), 1);
    }

    #[test]
    fn test_blocks_only_on_raw_events() {
        let mut plain = Event::new(TAG_BASE);
        plain.add_block(0, vec![1u8]);
        assert!(plain.blocks().is_empty());

        let mut raw = Event::raw("Mimosa", 1, 1, 1);
        raw.add_block(4, vec![1u8, 2, 3]);
        assert_eq!(raw.blocks().len(), 1);
        assert_eq!(raw.blocks()[0].id, 4);
    }
}
