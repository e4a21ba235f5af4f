//! Capture agent wiring: configuration and the HTTP API

pub mod api;
pub mod config;
