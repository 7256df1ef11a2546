// Public API - data types, the probing engine and report output
pub mod config;
pub mod error;
pub mod export;
pub mod probe;
pub mod state;
pub mod trace;

pub use config::{Config, IpVersion, ProbeProtocol};
pub use error::{ConfigError, TraceError};
pub use state::SessionResult;
pub use trace::{ResolvedTarget, Tracer, resolve_target, run_trace};
