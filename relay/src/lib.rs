//! Multiplexing daemon for MCP tool servers
//!
//! One long-running process keeps connections to many backend tool servers
//! alive so repeated calls skip the spawn and handshake cost.
//!
//! - [`pool`]: connection lifecycle, ids and idle reaping
//! - [`daemon`]: process lifecycle, discovery registry and HTTP control surface
//! - [`batch`]: many keyed calls with per-backend serialization and a deadline
//! - [`command`]: the closed set of commands and their executor

pub mod backend;
pub mod batch;
pub mod catalog;
pub mod command;
pub mod config;
pub mod daemon;
pub mod pool;

#[cfg(test)]
mod test_support;
