//! Workergate - on-demand application workers behind a reverse proxy
//!
//! This library provides the worker scheduling side of the proxy:
//! - Spawns one interpreter process per application, as the application's user
//! - Allocates a TCP port or unix socket per worker and health-checks it
//! - Counts the connections routed to each worker and reaps idle workers
//! - Turns away connections beyond an application's capacity
//! - Forwards raw TCP connections from an application port to its worker

pub mod accounts;
pub mod app_spec;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod launcher;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod simple_scheduler;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;
