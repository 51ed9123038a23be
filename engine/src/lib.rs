//! Infrabot engine
//!
//! A local automation assistant: a free-text operations request is planned,
//! turned into an Ansible playbook, executed once, reviewed and remembered.
//! The `infrabot` binary and the integration tests both build on this crate.

/// TOML configuration
pub mod config;

/// SQLite memory store
pub mod db;

/// Language-model gateway (Ollama)
pub mod llm;

/// Playbook execution
pub mod executor;

/// Keyword risk classification and the execution gate
pub mod risk_assessor;

/// Agents and the pipeline orchestrator
pub mod conductor;

/// Logging setup
pub mod telemetry;

pub mod cli;

/// Subcommand implementations
pub mod handlers;
