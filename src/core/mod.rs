//! Core building blocks shared by every other module: configuration,
//! the error taxonomy, the shared data model and the circuit breaker.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod types;
