//! Integration tests for taskpool
//!
//! Pools run in-process; listener tests bind loopback sockets on port 0.
//! Run with: cargo test --test integration

mod helpers;

mod listener;
mod metrics;
mod scaling;
mod signal;
