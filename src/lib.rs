//! MediaForge - generation job orchestrator for AI media pipelines.
//!
//! The crate wires a credit ledger, a model catalog with typed parameter
//! schemas, provider adapters (sync and async-poll), and a job state
//! machine with human approval gates into one orchestrator, fronted by a
//! small HTTP API and backed by SQLite.

pub mod api;
pub mod artifact;
pub mod audit;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod ledger;
pub mod orchestrator;
pub mod pricing;
pub mod provider;
pub mod ratelimit;
pub mod schema;
pub mod watchdog;

pub use error::{ForgeError, Result};
