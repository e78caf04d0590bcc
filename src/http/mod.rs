//! HTTP server wiring.

pub mod server;

pub use server::{AppState, HttpServer};
