//! Merges per-stream event queues into ordered composite events.
//!
//! # State Machine
//!
//! ```text
//! ┌────────────────┐ all heads BORE ┌─────────┐ begin_drain() ┌──────────┐
//! │ CollectingBore │───────────────▶│ Merging │──────────────▶│ Draining │
//! └────────────────┘                └─────────┘               └────┬─────┘
//!         ▲                                                        │
//!         └──────────────────────── reset() ───────────────────────┘
//! ```
//!
//! A composite is producible once every participating stream has a queued
//! event. A stream participates while it is connected and has not ended its
//! run, or while it still has queued events. While draining, streams with
//! empty queues stop participating so whatever remains can be flushed.
//!
//! Which heads form the next composite is decided by a [`SyncPolicy`]; the
//! core handles BORE and EORE sets itself.

pub mod policy;

pub use policy::{policy_by_name, IndexSync, SyncPolicy, TimestampSync, TriggerSync};

use crate::event::{Event, EventFlags, TAG_DETECTOR};
use chrono::Local;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Synchronizer phase within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Waiting for a BORE from every participating stream.
    CollectingBore,
    /// Emitting data composites.
    Merging,
    /// Stop requested: flush what is queued, allowing partial composites.
    Draining,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::CollectingBore => write!(f, "collecting-bore"),
            SyncState::Merging => write!(f, "merging"),
            SyncState::Draining => write!(f, "draining"),
        }
    }
}

#[derive(Debug, Default)]
struct StreamQueue {
    events: VecDeque<Arc<Event>>,
    connected: bool,
    ended: bool,
    last_event_number: Option<u32>,
}

impl StreamQueue {
    fn participates(&self, draining: bool) -> bool {
        if !self.events.is_empty() {
            return true;
        }
        !draining && self.connected && !self.ended
    }
}

/// Multi-stream merger.
pub struct EventSynchronizer {
    policy: Box<dyn SyncPolicy>,
    streams: BTreeMap<u32, StreamQueue>,
    output: VecDeque<Arc<Event>>,
    state: SyncState,
    bore_emitted: bool,
    run_number: Option<u32>,
    next_composite: u32,
    run_mismatches: u64,
}

impl std::fmt::Debug for EventSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSynchronizer")
            .field("policy", &self.policy.name())
            .field("state", &self.state)
            .field("streams", &self.streams.len())
            .field("output", &self.output.len())
            .finish()
    }
}

impl EventSynchronizer {
    /// Creates a synchronizer using `policy`.
    pub fn new(policy: Box<dyn SyncPolicy>) -> Self {
        Self {
            policy,
            streams: BTreeMap::new(),
            output: VecDeque::new(),
            state: SyncState::CollectingBore,
            bore_emitted: false,
            run_number: None,
            next_composite: 0,
            run_mismatches: 0,
        }
    }

    /// Name of the active policy.
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Replaces the policy; takes effect for the next composite.
    pub fn set_policy(&mut self, policy: Box<dyn SyncPolicy>) {
        self.policy = policy;
    }

    /// Current phase.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Run number adopted from the first BORE, if any.
    pub fn run_number(&self) -> Option<u32> {
        self.run_number
    }

    /// Fixes the expected run number ahead of the first BORE.
    pub fn set_run_number(&mut self, run: u32) {
        self.run_number = Some(run);
    }

    /// Composites produced this run.
    pub fn composites_emitted(&self) -> u32 {
        self.next_composite
    }

    /// Members whose run number disagreed with the run.
    pub fn run_mismatches(&self) -> u64 {
        self.run_mismatches
    }

    /// Number of known streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Registers a connected stream; it must deliver a BORE before merging starts.
    pub fn add_stream(&mut self, stream: u32) {
        let queue = self.streams.entry(stream).or_default();
        queue.connected = true;
        debug!(stream, "Stream added to synchronizer");
    }

    /// Marks a stream disconnected; its queued events still take part.
    pub fn remove_stream(&mut self, stream: u32) {
        if let Some(queue) = self.streams.get_mut(&stream) {
            queue.connected = false;
            info!(stream, queued = queue.events.len(), "Stream left synchronizer");
        }
        self.produce();
    }

    /// Queues one event from `stream` and emits whatever became producible.
    pub fn push(&mut self, ev: Arc<Event>, stream: u32) {
        let queue = self.streams.entry(stream).or_insert_with(|| StreamQueue {
            connected: true,
            ..StreamQueue::default()
        });
        if let Some(last) = queue.last_event_number {
            if ev.event_number <= last && !ev.is_bore() {
                warn!(stream, last, got = ev.event_number, "Event number not increasing");
            } else if ev.event_number > last.saturating_add(1) {
                warn!(stream, last, got = ev.event_number, "Event number jump");
            }
        }
        queue.last_event_number = Some(ev.event_number);
        queue.events.push_back(ev);
        self.produce();
    }

    /// Next composite, oldest first.
    pub fn pop_output(&mut self) -> Option<Arc<Event>> {
        self.output.pop_front()
    }

    /// Whether every produced composite has been consumed.
    pub fn output_is_empty(&self) -> bool {
        self.output.is_empty()
    }

    /// Whether production is currently blocked on missing input.
    pub fn input_is_empty(&self) -> bool {
        let draining = self.state == SyncState::Draining;
        let participants: Vec<&StreamQueue> = self
            .streams
            .values()
            .filter(|q| q.participates(draining))
            .collect();
        participants.is_empty() || participants.iter().any(|q| q.events.is_empty())
    }

    /// Whether every stream has ended its run or disconnected with nothing queued.
    pub fn all_streams_finished(&self) -> bool {
        self.streams
            .values()
            .all(|q| q.events.is_empty() && (q.ended || !q.connected))
    }

    /// Enters draining: streams with nothing queued no longer hold up output.
    pub fn begin_drain(&mut self) {
        if self.state != SyncState::Draining {
            debug!(from = %self.state, "Synchronizer draining");
            self.state = SyncState::Draining;
        }
        self.produce();
    }

    /// Clears every queue for the next run and forgets disconnected streams.
    pub fn reset(&mut self) {
        let dropped: usize = self.streams.values().map(|q| q.events.len()).sum();
        if dropped > 0 || !self.output.is_empty() {
            warn!(dropped, unconsumed = self.output.len(), "Synchronizer reset discarded events");
        }
        self.streams.retain(|_, q| q.connected);
        for queue in self.streams.values_mut() {
            queue.events.clear();
            queue.ended = false;
            queue.last_event_number = None;
        }
        self.output.clear();
        self.state = SyncState::CollectingBore;
        self.bore_emitted = false;
        self.run_number = None;
        self.next_composite = 0;
        self.run_mismatches = 0;
    }

    fn produce(&mut self) {
        while let Some(members) = self.next_members() {
            let composite = self.build_composite(members);
            self.output.push_back(Arc::new(composite));
        }
    }

    fn next_members(&mut self) -> Option<Vec<Arc<Event>>> {
        loop {
            let draining = self.state == SyncState::Draining;
            let participants: Vec<u32> = self
                .streams
                .iter()
                .filter(|(_, q)| q.participates(draining))
                .map(|(id, _)| *id)
                .collect();
            if participants.is_empty() {
                return None;
            }
            if participants.iter().any(|id| self.streams[id].events.is_empty()) {
                return None;
            }

            let collecting = !self.bore_emitted;
            // Stray heads: data before any BORE, or a BORE from a stream joining late.
            let stray: Vec<u32> = participants
                .iter()
                .copied()
                .filter(|id| {
                    let head_is_bore = self.streams[id].events.front().map(|e| e.is_bore()).unwrap_or(false);
                    head_is_bore != collecting
                })
                .collect();
            if !stray.is_empty() {
                for id in stray {
                    if let Some(ev) = self.streams.get_mut(&id).and_then(|q| q.events.pop_front()) {
                        if collecting {
                            warn!(stream = id, "Dropping {} received before the stream's BORE", ev);
                        } else {
                            info!(stream = id, "Stream joined after start of run, skipping its BORE");
                        }
                    }
                }
                continue;
            }

            if collecting {
                self.bore_emitted = true;
                if self.state == SyncState::CollectingBore {
                    self.state = SyncState::Merging;
                }
                return Some(self.pop_heads(&participants));
            }

            let (eore, live): (Vec<u32>, Vec<u32>) = participants
                .iter()
                .copied()
                .partition(|id| self.streams[id].events.front().map(|e| e.is_eore()).unwrap_or(false));
            if live.is_empty() {
                for id in &eore {
                    if let Some(q) = self.streams.get_mut(id) {
                        q.ended = true;
                    }
                }
                return Some(self.pop_heads(&eore));
            }

            let heads: Vec<(u32, &Event)> = live
                .iter()
                .filter_map(|id| self.streams[id].events.front().map(|e| (*id, e.as_ref())))
                .collect();
            let selected = self.policy.select(&heads)?;
            if selected.is_empty() {
                return None;
            }
            return Some(self.pop_heads(&selected));
        }
    }

    fn pop_heads(&mut self, ids: &[u32]) -> Vec<Arc<Event>> {
        ids.iter()
            .filter_map(|id| self.streams.get_mut(id).and_then(|q| q.events.pop_front()))
            .collect()
    }

    fn build_composite(&mut self, members: Vec<Arc<Event>>) -> Event {
        let mut composite = Event::new(TAG_DETECTOR);
        let run = match self.run_number {
            Some(run) => run,
            None => {
                let run = members.first().map(|e| e.run_number).unwrap_or_default();
                self.run_number = Some(run);
                run
            }
        };
        for member in &members {
            if member.run_number != run {
                self.run_mismatches += 1;
                error!(
                    stream = member.stream_id,
                    expected = run,
                    got = member.run_number,
                    "Run number mismatch in composite {}",
                    self.next_composite
                );
            }
        }
        if let Some(problem) = self.policy.check(&members) {
            warn!(composite = self.next_composite, "{}", problem);
        }

        composite.run_number = run;
        composite.event_number = self.next_composite;
        self.next_composite += 1;

        if members.iter().any(|e| e.is_bore()) {
            composite.flags |= EventFlags::BORE;
            composite.set_tag("STARTTIME", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"));
        }
        if members.iter().any(|e| e.is_eore()) {
            composite.flags |= EventFlags::EORE;
            composite.set_tag("STOPTIME", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"));
        }
        let timed: Vec<&Arc<Event>> = members.iter().filter(|e| e.flags.contains(EventFlags::TIME)).collect();
        if let (Some(begin), Some(end)) = (
            timed.iter().map(|e| e.ts_begin).min(),
            timed.iter().map(|e| e.ts_end).max(),
        ) {
            composite.set_timestamps(begin, end);
        }
        let mut triggers = members
            .iter()
            .filter(|e| e.flags.contains(EventFlags::TRIG))
            .map(|e| e.trigger_number);
        if let Some(first) = triggers.next() {
            if triggers.all(|t| t == first) {
                composite.set_trigger(first);
            }
        }
        for member in members {
            composite.add_sub_event(member);
        }
        composite
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(stream: u32, run: u32, n: u32) -> Arc<Event> {
        Arc::new(Event::raw("Test", stream, run, n))
    }

    fn drain(sync: &mut EventSynchronizer) -> Vec<Arc<Event>> {
        std::iter::from_fn(|| sync.pop_output()).collect()
    }

    #[test]
    fn test_three_streams_index_merge() {
        let mut sync = EventSynchronizer::new(Box::new(IndexSync));
        for s in 0..3 {
            sync.add_stream(s);
        }
        for s in 0..3 {
            sync.push(Arc::new(Event::bore("Test", s, 7)), s);
        }
        for n in 1..=5 {
            for s in 0..3 {
                sync.push(data(s, 7, n), s);
            }
        }
        for s in 0..3 {
            sync.push(Arc::new(Event::eore("Test", s, 7, 6)), s);
        }

        let out = drain(&mut sync);
        assert_eq!(out.len(), 7);
        assert!(out[0].is_bore());
        assert!(out[6].is_eore());
        for (i, composite) in out.iter().enumerate() {
            assert_eq!(composite.event_number, i as u32);
            assert_eq!(composite.run_number, 7);
            assert_eq!(composite.sub_events.len(), 3);
            for member in &composite.sub_events {
                assert_eq!(member.event_number, i as u32);
            }
        }
        assert!(sync.output_is_empty());
        assert!(sync.all_streams_finished());
        assert_eq!(sync.run_mismatches(), 0);
    }

    #[test]
    fn test_bore_held_until_every_stream_delivers() {
        let mut sync = EventSynchronizer::new(Box::new(IndexSync));
        sync.add_stream(0);
        sync.add_stream(1);
        sync.push(Arc::new(Event::bore("Test", 0, 1)), 0);
        sync.push(data(0, 1, 1), 0);
        assert!(sync.output_is_empty());
        assert!(sync.input_is_empty());
        assert_eq!(sync.state(), SyncState::CollectingBore);

        sync.push(Arc::new(Event::bore("Test", 1, 1)), 1);
        assert_eq!(sync.state(), SyncState::Merging);
        let bore = sync.pop_output().unwrap();
        assert!(bore.is_bore());
        assert!(bore.tag("STARTTIME").is_some());
        // Stream 0's data waits for stream 1.
        assert!(sync.output_is_empty());
    }

    #[test]
    fn test_run_mismatch_reported_not_fatal() {
        let mut sync = EventSynchronizer::new(Box::new(IndexSync));
        sync.set_run_number(5);
        sync.add_stream(0);
        sync.add_stream(1);
        sync.push(Arc::new(Event::bore("Test", 0, 5)), 0);
        sync.push(Arc::new(Event::bore("Test", 1, 6)), 1);
        assert_eq!(drain(&mut sync).len(), 1);
        assert_eq!(sync.run_mismatches(), 1);
    }

    #[test]
    fn test_disconnected_stream_stops_blocking() {
        let mut sync = EventSynchronizer::new(Box::new(IndexSync));
        sync.add_stream(0);
        sync.add_stream(1);
        sync.push(Arc::new(Event::bore("Test", 0, 1)), 0);
        sync.push(Arc::new(Event::bore("Test", 1, 1)), 1);
        sync.push(data(0, 1, 1), 0);
        sync.push(data(1, 1, 1), 1);
        sync.push(data(0, 1, 2), 0);
        assert_eq!(drain(&mut sync).len(), 2);

        sync.remove_stream(1);
        let out = drain(&mut sync);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sub_events.len(), 1);
        assert_eq!(out[0].sub_events[0].stream_id, 0);
    }

    #[test]
    fn test_drain_flushes_partial_composites() {
        let mut sync = EventSynchronizer::new(Box::new(IndexSync));
        sync.add_stream(0);
        sync.add_stream(1);
        sync.push(Arc::new(Event::bore("Test", 0, 1)), 0);
        sync.push(Arc::new(Event::bore("Test", 1, 1)), 1);
        sync.push(data(0, 1, 1), 0);
        sync.push(data(0, 1, 2), 0);
        assert_eq!(drain(&mut sync).len(), 1);

        sync.begin_drain();
        let out = drain(&mut sync);
        assert_eq!(out.len(), 2);
        assert!(sync.input_is_empty());

        sync.reset();
        assert_eq!(sync.state(), SyncState::CollectingBore);
        assert_eq!(sync.composites_emitted(), 0);
        assert_eq!(sync.stream_count(), 2);
    }

    #[test]
    fn test_data_before_bore_is_dropped() {
        let mut sync = EventSynchronizer::new(Box::new(IndexSync));
        sync.add_stream(0);
        sync.push(data(0, 1, 3), 0);
        assert!(sync.output_is_empty());
        sync.push(Arc::new(Event::bore("Test", 0, 1)), 0);
        assert!(sync.pop_output().unwrap().is_bore());
    }

    #[test]
    fn test_trigger_policy_emits_partial_for_missing_trigger() {
        let mut sync = EventSynchronizer::new(Box::new(TriggerSync));
        sync.add_stream(0);
        sync.add_stream(1);
        sync.push(Arc::new(Event::bore("Test", 0, 1)), 0);
        sync.push(Arc::new(Event::bore("Test", 1, 1)), 1);
        for (stream, triggers) in [(0u32, vec![1u32, 2, 3]), (1, vec![1, 3])] {
            for (i, t) in triggers.into_iter().enumerate() {
                let mut ev = Event::raw("Test", stream, 1, i as u32 + 1);
                ev.set_trigger(t);
                sync.push(Arc::new(ev), stream);
            }
        }
        let out = drain(&mut sync);
        // BORE, trigger 1 (both), trigger 2 (stream 0 only), trigger 3 (both)
        assert_eq!(out.len(), 4);
        assert_eq!(out[1].sub_events.len(), 2);
        assert_eq!(out[1].trigger_number, 1);
        assert_eq!(out[2].sub_events.len(), 1);
        assert_eq!(out[2].trigger_number, 2);
        assert_eq!(out[3].sub_events.len(), 2);
        assert_eq!(out[3].trigger_number, 3);
    }
}
