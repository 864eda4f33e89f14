//! paygrid settlement router — the HTTP surface over the settlement core.
//!
//! Resource servers POST payment proofs to `/settle`; the router runs the
//! policy, verification, replay, and ledger pipeline from the [`paygrid`]
//! core crate and answers with a uniform settlement result or a structured
//! error envelope.
//!
//! # Modules
//!
//! - [`routes`] — HTTP endpoints (settle, supported, health, metrics)
//! - [`state`] — shared [`AppState`](state::AppState)
//! - [`config`] — environment-driven configuration
//! - [`metrics`] — Prometheus metrics for the settlement path

pub mod config;
pub mod metrics;
pub mod routes;
pub mod state;
