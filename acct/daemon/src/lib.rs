//! Conntrack Accounting Userspace Library
//!
//! Loads the conntrack accounting eBPF program, decodes the events it
//! streams and fans them out to independent consumers and sinks.

pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod kallsyms;
pub mod kernel;
pub mod loader;
pub mod perf;
pub mod pipeline;
pub mod probe;
pub mod sink;
pub mod stats;
pub mod sysctl;

#[cfg(test)]
mod testing;

pub use config::{Config, RateCurvePoint};
pub use consumer::{Consumer, ConsumerMode, Inbox};
pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use kallsyms::Kallsyms;
pub use kernel::{Kernel, KernelProbe, KernelVersion};
pub use loader::ProbeLoader;
pub use pipeline::Pipeline;
pub use probe::{Probe, ProbeState, Program};
pub use sink::{InfluxSink, JsonSink, Sink, SinkType};
pub use stats::{ConsumerStats, PipelineStats, ProbeStats};
