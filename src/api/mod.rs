//! HTTP API Module
//!
//! Exposes the client request/response contract and node status over HTTP.

mod http;

pub use http::{HttpServer, CoordinatorResponse, HealthResponse, ErrorResponse};
