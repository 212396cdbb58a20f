//! # backlog-adapters
//!
//! Subprocess agents for the Backlog engine.
//!
//! This crate provides:
//! - `CliBackend`, the per-CLI command presets (Claude, Codex, Gemini, Amp,
//!   Copilot, OpenCode, custom)
//! - `CliAgent`, an `Agent` that runs a backend with `tokio::process`
//! - `CliAgentFactory`, the `AgentFactory` the engine builds agents with
//! - `SubagentParser`, which turns Claude `stream-json` output into subagent
//!   lifecycle events

mod cli_agent;
mod cli_backend;
mod stream_json;

pub use cli_agent::{CliAgent, CliAgentFactory, PREFLIGHT_PROMPT};
pub use cli_backend::{BackendError, BuiltCommand, CliBackend, OutputFormat};
pub use stream_json::SubagentParser;
