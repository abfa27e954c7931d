//! # rust_eudaq
//!
//! Control plane of a distributed data-acquisition system. Independent
//! processes (roles) connect to one RunControl, are driven through a common
//! state machine, stream events to a DataCollector that merges them into
//! composite events, and forward log messages to a LogCollector.
//!
//! ## Crate Structure
//!
//! - **`transport`**: framed TCP and the `null://` test transport, with a
//!   connection arena keyed by generated handles.
//! - **`protocol`**: text handshake on the CMD, DATA and LOG channels and the
//!   `KEYWORD\0param` command line.
//! - **`status`**: role state, severity levels and the status reply.
//! - **`serialize`**: little-endian binary serializer shared by events,
//!   status replies and log messages.
//! - **`event`**: the `Event` model and the type-id keyed decoder registry.
//! - **`queue`**: bounded drop-oldest FIFO between network and worker tasks.
//! - **`command_receiver`**: role side of the CMD channel and the
//!   `CommandHandler` trait.
//! - **`run_control`**: server side of the CMD channel; sequences runs.
//! - **`data_sender`** / **`data_receiver`**: the DATA channel.
//! - **`sync`**: `EventSynchronizer` and its pluggable pairing policies.
//! - **`data_collector`**: receiver, synchronizer and file writer as a role.
//! - **`writer`**: `FileWriter` collaborators and their registry.
//! - **`log`**: LOG channel messages, sender and collector role.
//! - **`producer`**: producer adapter and a simulated producer.
//! - **`config`** / **`run_config`**: process configuration (Figment) and the
//!   run configuration distributed with `INIT` and `CONFIG`.
//! - **`telemetry`**: `tracing` subscriber setup.
//! - **`error`** / **`limits`**: error taxonomy and shared timeouts/capacities.

pub mod command_receiver;
pub mod config;
pub mod data_collector;
pub mod data_receiver;
pub mod data_sender;
pub mod error;
pub mod event;
pub mod limits;
pub mod log;
pub mod producer;
pub mod protocol;
pub mod queue;
pub mod run_config;
pub mod run_control;
pub mod serialize;
pub mod status;
pub mod sync;
pub mod telemetry;
pub mod transport;
pub mod writer;

pub use error::{AppResult, DaqError};
