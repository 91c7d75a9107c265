//! HTTP API Module
//!
//! Provides a REST API for cluster administration and transactions.

mod http;

pub use http::{AppState, HttpServer};
