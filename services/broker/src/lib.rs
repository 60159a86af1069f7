//! Broker service library crate.
//!
//! # Purpose
//! Exposes broker subsystems (config, sessions, the event fan-out, the
//! transaction/stream services and the supervisor) for use by the
//! `quiverd` binary and integration tests.
//!
//! # Notes
//! The public surface here is intentionally minimal and organized by
//! feature area.
pub mod config;
pub mod error;
pub mod fanout;
pub mod observability;
pub mod pipeline;
pub mod services;
pub mod session;
pub mod session_manager;
pub mod supervisor;
pub mod transport;
