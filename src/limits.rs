//! Shared limits and timing constants.
//!
//! This module centralizes:
//! - Handshake and command timeouts
//! - Retry budgets and polling intervals
//! - Queue capacities and packet size limits
//!
//! The process configuration overrides most of these; the constants are the
//! serde defaults and the values used by tests.

use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// How long a client waits for the server greeting after connecting.
pub const GREETING_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a client waits for the bare `OK` after identifying itself.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on a single command round trip from RunControl.
///
/// Longer than [`STOP_DRAIN_TIMEOUT`] since a DataCollector replies to `STOP`
/// only after draining.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Grace period between broadcasting `TERMINATE` and closing the server.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Bound on how long a DataCollector waits for streams to finish on `STOP`.
pub const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout used by the network loops for one `process` step.
pub const PROCESS_TIMEOUT: Duration = Duration::from_millis(100);

/// Default idle hook interval of the command dispatch loop.
pub const IDLE_INTERVAL: Duration = Duration::from_millis(500);

/// Periodic wake of queue waiters so they re-check shutdown flags.
pub const QUEUE_WAKE_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Retry / Polling
// =============================================================================

/// Connection establishment attempts made by a CommandReceiver.
pub const CONNECT_RETRIES: u32 = 10;

/// Delay between connection attempts.
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// `STATUS` polls RunControl makes while waiting for a state transition.
pub const STATE_POLL_ATTEMPTS: u32 = 30;

/// Interval between `STATUS` polls.
pub const STATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Size Limits
// =============================================================================

/// Capacity of the DataReceiver FIFO before the oldest entry is dropped.
pub const RECEIVER_QUEUE_CAPACITY: usize = 50_000;

/// Capacity of the asynchronous DataSender queue.
pub const SENDER_QUEUE_CAPACITY: usize = 10_000;

/// Capacity of the LogSender queue.
pub const LOG_QUEUE_CAPACITY: usize = 1_000;

/// Largest packet accepted by the TCP framing layer (64 MiB).
pub const MAX_PACKET_BYTES: usize = 64 * 1024 * 1024;

/// Deepest chain of sub-events accepted when decoding one event.
pub const MAX_SUB_EVENT_DEPTH: usize = 16;

/// Capacity of the per-server event channel between connection tasks and `process`.
pub const TRANSPORT_EVENT_CAPACITY: usize = 4_096;
