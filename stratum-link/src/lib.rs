//! Client-side Stratum v1 endpoint.

pub mod config;
pub mod stratum_v1;
pub mod tracing;
