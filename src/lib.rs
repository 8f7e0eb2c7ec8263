//! Object detection dispatch
//!
//! This library provides the dispatch core for the detection service: the
//! API-side submitter that records and enqueues jobs and waits for their
//! results, the worker loop that consumes the Redis queue and runs
//! inference, and the protocol that correlates the two through per-job
//! response slots.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;
