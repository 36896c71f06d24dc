// ABOUTME: Core library for switchyard - resilient dispatch to command-line AI backends
// ABOUTME: Circuit breakers, router, streaming process runner, line parser, and orchestrator

pub mod backend;
pub mod breaker;
pub mod config;
pub mod error;
pub mod normalize;
pub mod orchestrator;
pub mod parser;
pub mod router;
pub mod runner;
pub mod types;

pub use backend::{Backend, CliBackend, CommandTemplate, Fragment, FragmentStream};
pub use breaker::{BreakerSettings, BreakerSnapshot, BreakerTable, CircuitBreaker, CircuitState};
pub use config::Config;
pub use error::{BackendInvocationError, ErrorCode, RunError};
pub use normalize::normalize_one_shot;
pub use orchestrator::{EventStream, Orchestrator};
pub use parser::parse_line;
pub use router::{BackendRouter, RouterError};
pub use runner::{LineStream, ProcessStreamRunner, RunEvent, RunSpec};
pub use types::{
    BackendInvokeRequest, BackendMode, BackendName, BackendStreamEvent, StreamSource,
    StreamedLine,
};
