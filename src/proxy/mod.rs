//! Proxy dispatch subsystem.
//!
//! # Responsibilities
//! - Authenticate and authorize the caller
//! - Select and fall back across candidate backends
//! - Enforce TTFT deadlines and the streaming commit point
//! - Pair every slot acquisition with exactly one release

pub mod error;
pub mod handler;
pub mod streaming;
pub mod upstream;

pub use error::ProxyError;
