//! Test utilities for the benchmark harness.
//!
//! This crate provides an in-process mock of the storage service API and a tracing setup for tests.
//! See the modules for all available utilities.

pub mod server;
pub mod tracing;
