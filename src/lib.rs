//! # sparkq
//!
//! Local task queue backed by SQLite.
//!
//! Provides the project → session → queue → task hierarchy, an atomic
//! task lifecycle (queued → running → succeeded | failed), per-queue
//! runners, a stale-task watchdog, PID lockfiles, and OpenTelemetry
//! observability.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod invoker;
pub mod lock;
pub mod model;
pub mod telemetry;
