pub mod engine;
pub mod pending;
pub mod receiver;

pub use engine::{ResolvedTarget, TraceState, Tracer, resolve_target, run_trace};
pub use pending::{CorrelationTable, ProbeRecord, SharedTables, TraceTables};
pub use receiver::{Receiver, ReceiverConfig, spawn_receiver};
