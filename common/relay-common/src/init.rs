//! Tracing initialization
//!
//! The daemon and the CLI log to stderr so that stdout stays free for
//! command output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for a relay binary
///
/// Sets up logging to stderr with:
/// - Environment-based filtering via RUST_LOG
/// - Default log level of `info` for the specified crate
///
/// Set `LOG_FORMAT=json` for structured JSON output (useful when the daemon
/// log is collected by something else). Default is human-readable text.
///
/// # Example
///
/// ```rust,ignore
/// relay_common::init_tracing("mcp_relay")?;
/// ```
pub fn init_tracing(crate_name: &str) -> anyhow::Result<()> {
    let directive = format!("{}=info", crate_name);
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);

    let registry = tracing_subscriber::registry().with(filter);

    if json_requested(std::env::var("LOG_FORMAT").ok().as_deref()) {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()?;
    }

    Ok(())
}

fn json_requested(value: Option<&str>) -> bool {
    value.map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false)
}
