//! Collector coordinator: schema extraction, tracing-program generation,
//! attach/detach control, backend lifecycle tracking, record routing, and
//! per-OU output sinks.

pub mod attach;
pub mod codegen;
pub mod decls;
pub mod sink;

pub use attach::{AttachConfig, Coordinator};
pub use sink::SinkSet;
