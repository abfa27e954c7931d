//! Pairing policies selectable at configure time by name.

use crate::error::{AppResult, DaqError};
use crate::event::{Event, EventFlags};
use std::sync::Arc;

/// Decides which queued heads form the next composite.
pub trait SyncPolicy: Send {
    /// Name used in configuration.
    fn name(&self) -> &'static str;

    /// Picks streams from `heads` (one non-marker head per participating
    /// stream). `None` waits for more input.
    fn select(&mut self, heads: &[(u32, &Event)]) -> Option<Vec<u32>>;

    /// Optional consistency check on the chosen members.
    fn check(&self, _members: &[Arc<Event>]) -> Option<String> {
        None
    }
}

/// Strict round-robin: the i-th event of every stream forms composite i.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexSync;

impl SyncPolicy for IndexSync {
    fn name(&self) -> &'static str {
        "index"
    }

    fn select(&mut self, heads: &[(u32, &Event)]) -> Option<Vec<u32>> {
        Some(heads.iter().map(|(id, _)| *id).collect())
    }

    fn check(&self, members: &[Arc<Event>]) -> Option<String> {
        let first = members.first()?.event_number;
        if members.iter().all(|e| e.event_number == first) {
            return None;
        }
        let numbers: Vec<String> = members
            .iter()
            .map(|e| format!("{}:{}", e.stream_id, e.event_number))
            .collect();
        Some(format!("Event numbers out of step: {}", numbers.join(", ")))
    }
}

/// Groups heads carrying the lowest trigger number; others keep waiting.
///
/// Events without the `TRIG` flag are matched on their event number.
#[derive(Debug, Default, Clone, Copy)]
pub struct TriggerSync;

fn trigger_of(ev: &Event) -> u32 {
    if ev.flags.contains(EventFlags::TRIG) {
        ev.trigger_number
    } else {
        ev.event_number
    }
}

impl SyncPolicy for TriggerSync {
    fn name(&self) -> &'static str {
        "trigger"
    }

    fn select(&mut self, heads: &[(u32, &Event)]) -> Option<Vec<u32>> {
        let lowest = heads.iter().map(|(_, ev)| trigger_of(ev)).min()?;
        Some(
            heads
                .iter()
                .filter(|(_, ev)| trigger_of(ev) == lowest)
                .map(|(id, _)| *id)
                .collect(),
        )
    }
}

/// Groups heads whose `[ts_begin, ts_end)` windows overlap the earliest one.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampSync {
    /// Slack added on both sides of every window, in timestamp units.
    pub tolerance: u64,
}

impl SyncPolicy for TimestampSync {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn select(&mut self, heads: &[(u32, &Event)]) -> Option<Vec<u32>> {
        let (ref_id, reference) = heads.iter().min_by_key(|(_, ev)| ev.ts_begin)?;
        let begin = reference.ts_begin.saturating_sub(self.tolerance);
        let end = reference.ts_end.max(reference.ts_begin).saturating_add(self.tolerance);
        Some(
            heads
                .iter()
                .filter(|(id, ev)| id == ref_id || (ev.ts_begin <= end && ev.ts_end.max(ev.ts_begin) >= begin))
                .map(|(id, _)| *id)
                .collect(),
        )
    }
}

/// Builds a policy from its configured name.
pub fn policy_by_name(name: &str, tolerance: u64) -> AppResult<Box<dyn SyncPolicy>> {
    match name.to_ascii_lowercase().as_str() {
        "index" | "" => Ok(Box::new(IndexSync)),
        "trigger" => Ok(Box::new(TriggerSync)),
        "timestamp" => Ok(Box::new(TimestampSync { tolerance })),
        other => Err(DaqError::Configuration(format!(
            "unknown sync algorithm '{other}', expected index, trigger or timestamp"
        ))),
    }
}
