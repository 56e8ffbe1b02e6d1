//! # siptty console
//!
//! A line-oriented front end for the siptty engine. It parses operator
//! commands, renders engine events one line each, and takes care of the
//! process plumbing a terminal client needs: configuration lookup, file
//! logging and two-stage signal handling.
//!
//! The Signaling Provider is supplied by the embedding binary:
//!
//! ```rust,no_run
//! use siptty_console::app::{run_app, AppOptions};
//! use siptty_engine_core::provider::ProviderFactory;
//!
//! async fn main_with(factory: &dyn ProviderFactory) -> anyhow::Result<()> {
//!     run_app(AppOptions::default(), factory).await
//! }
//! ```

pub mod app;
pub mod command;
pub mod console;
pub mod logging;
pub mod render;
pub mod shutdown;

pub use command::{Command, CommandError};
pub use console::Console;
pub use logging::{init_logging, LoggingConfig};
