//! Replication protocol: producer/consumer stream state machines, flow
//! control, and the binary wire framing between them (spec.md §4.6-§4.7,
//! §6.1).

pub mod buffer_log;
pub mod consumer;
pub mod producer;
pub mod wire;

pub use buffer_log::{BufferLog, BufferLogState};
pub use consumer::{PassiveStream, PassiveStreamState};
pub use producer::{ActiveStream, StreamPhase};
pub use wire::DcpMessage;
