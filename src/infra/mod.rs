//! Infrastructure adapters and runtime bootstrap.

pub mod content;
pub mod error;
pub mod events;
pub mod http;
pub mod telemetry;
