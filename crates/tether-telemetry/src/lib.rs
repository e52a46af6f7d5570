//! Tether Telemetry - Logging and tracing for the Tether plugin runtime.
//!
//! This crate provides:
//! - Configurable logging setup with multiple formats and targets
//! - [`InvocationContext`] spans correlating everything one handler
//!   invocation logs, including the plugin's own `context.logger` output
//!
//! # Example
//!
//! ```rust,no_run
//! use tether_telemetry::{InvocationContext, LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), tether_telemetry::TelemetryError> {
//! let config = LogConfig::new("debug")
//!     .with_format(LogFormat::Pretty)
//!     .with_directive("tether_plugins=trace");
//!
//! setup_logging(&config)?;
//!
//! let ctx = InvocationContext::new("sheet-tools", "tool", "read_range");
//! let _entered = ctx.span().entered();
//! tracing::info!("Executing handler");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod context;
mod error;
mod logging;

pub use context::InvocationContext;
pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileLogConfig, FileRotation, LogConfig, LogFormat, LogTarget, setup_default_logging,
    setup_logging,
};
