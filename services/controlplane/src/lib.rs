//! Nimbus control-plane library crate.
//!
//! # Purpose
//! Exposes the HTTP API, the generic record engine, compute orchestration,
//! configuration and storage backends for use by the binary and tests.
pub mod api;
pub mod app;
pub mod compute;
pub mod config;
pub mod engine;
pub mod model;
pub mod observability;
pub mod retry;
pub mod store;
