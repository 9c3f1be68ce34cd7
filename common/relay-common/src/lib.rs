//! Relay Common - pieces shared by the mcp-relay daemon and its clients
//!
//! - **Envelope**: [`Envelope`] wraps every control-surface response
//! - **Errors**: [`ErrorCode`] and [`ApiError`] carry stable failure codes
//! - **Initialization**: [`init_tracing`] for consistent stderr logging
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_common::{ApiError, Envelope};
//!
//! let ok = Envelope::ok(serde_json::json!({"pid": 42}));
//! let err: Envelope<()> = Envelope::err(ApiError::backend_not_found("github"));
//! ```

pub mod envelope;
pub mod error;
pub mod init;

pub use envelope::{Envelope, Meta};
pub use error::{ApiError, ErrorCode};
pub use init::init_tracing;
