//! `airmeter-runtime` – the command-and-telemetry coordination loop.
//!
//! # Modules
//!
//! - [`command`] – the command channel: [`CommandSender`] for fire-and-forget
//!   commands and bounded synchronous reads with a per-request reply.
//! - [`coordinator`] – [`CoordinationLoop`], the single scheduler that owns
//!   the sensor and multiplexes timer ticks, commands, and cancellation.
//! - [`agent`] – [`Agent`]: bus connection with retry, task supervision, and
//!   orderly teardown around the loop.
//! - [`telemetry`] – [`init_tracing`]: global `tracing` subscriber with
//!   optional OTLP export.

pub mod agent;
pub mod command;
pub mod coordinator;
pub mod telemetry;

pub use agent::{Agent, AgentConfig, BusSettings};
pub use command::{Command, CommandReceiver, CommandSender, Reply, command_channel};
pub use coordinator::{CoordinationLoop, LoopConfig, LoopExit, LoopOutcome};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
