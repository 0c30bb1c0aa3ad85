//! sandbox-exec-engine library
//!
//! Runs untrusted Python and JavaScript in network-isolated containers and
//! reports wall time, peak memory and CPU utilization:
//! - Request validation and the response contract
//! - Sandbox lifecycle over a pluggable container runtime (Docker CLI)
//! - Periodic metrics sampling and aggregation
//! - Standard and hardened isolation profiles
//! - MCP server exposing execution, a function registry and execution history

pub mod assemble;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod mcp;
pub mod metrics;
pub mod profile;
pub mod registry;
pub mod request;
pub mod sandbox;
