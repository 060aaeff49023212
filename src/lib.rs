//! Bridge broker telemetry into a key-value cache and serve it over HTTP.

pub mod api;
pub mod auth;
pub mod broker;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod infra;
pub mod ingest;
