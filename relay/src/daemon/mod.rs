//! Daemon process: lifecycle, discovery registry and control surface
//!
//! - [`Daemon`] binds the listener, registers itself, watches its parent and
//!   runs the ordered shutdown
//! - [`DiscoveryRegistry`] lets other processes find a live daemon
//! - [`DaemonClient`] talks to a daemon over HTTP

mod api;
mod client;
mod lifecycle;
mod process;
mod registry;

pub use api::{router, ApiState, ConnectionResponse, DaemonStatus};
pub use client::{ensure_no_running_singleton, DaemonClient};
pub use lifecycle::{Daemon, DaemonState, LISTENER_CLOSE_TIMEOUT};
pub use process::pid_alive;
pub use registry::{DaemonDescriptor, DaemonSelector, DiscoveryRegistry, RegistryError};
