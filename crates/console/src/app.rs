//! Process bootstrap for an embedding binary
//!
//! ```rust,no_run
//! use siptty_console::app::{run_app, AppOptions};
//! # use siptty_engine_core::provider::ProviderFactory;
//! # async fn example(factory: &dyn ProviderFactory) -> anyhow::Result<()> {
//! run_app(AppOptions::default(), factory).await
//! # }
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use siptty_engine_core::config::{find_config_file, Config};
use siptty_engine_core::provider::ProviderFactory;
use siptty_engine_core::Engine;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use crate::console::Console;
use crate::logging::{init_logging, LoggingConfig};
use crate::shutdown::spawn_signal_watcher;

/// Startup options
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    /// Config file; searched for when absent
    pub config_path: Option<PathBuf>,
    /// Render SIP traces from the start
    pub show_traces: bool,
}

/// Load the configuration from `path`, or from the first standard location
pub fn load_config(path: Option<&Path>) -> anyhow::Result<(PathBuf, Config)> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => find_config_file().context("locating config file")?,
    };
    let config = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;
    Ok((path, config))
}

/// Load config, set up logging, start the engine and run the console on
/// stdin/stdout until the operator quits or a signal arrives
pub async fn run_app(options: AppOptions, factory: &dyn ProviderFactory) -> anyhow::Result<()> {
    let (path, config) = load_config(options.config_path.as_deref())?;
    let _log_guard = init_logging(&LoggingConfig::from_general(&config.general))?;
    tracing::info!(config = %path.display(), version = env!("CARGO_PKG_VERSION"), "starting siptty");

    let (engine, events) = Engine::new(&config, factory).context("creating engine")?;

    let cancel = CancellationToken::new();
    let _watcher = spawn_signal_watcher(cancel.clone());
    engine.start(cancel.clone()).await.context("starting engine")?;

    let console = Console::new(engine, tokio::io::stdout()).with_traces(options.show_traces);
    console
        .run(events, BufReader::new(tokio::io::stdin()), cancel)
        .await?;

    tracing::info!("siptty exited");
    Ok(())
}
