//! Runtime configuration resolved from the environment.
//!
//! Sidekick is configured through `SIDE_*` environment variables with
//! XDG-style fallbacks for its data and state directories. There is no
//! config file; everything the server needs at startup fits in a handful
//! of variables.

use std::path::PathBuf;

use anyhow::Context;
use etcetera::BaseStrategy;
use log::LevelFilter;

/// Base directory variable for worktrees and persisted data.
pub const DATA_HOME_ENV: &str = "SIDE_DATA_HOME";

/// Integer log level (zerolog numbering: -1 trace, 0 debug, 1 info,
/// 2 warn, 3 error).
pub const LOG_LEVEL_ENV: &str = "SIDE_LOG_LEVEL";

/// Fallback token cap for embedding models missing from the built-in table.
pub const EMBEDDING_DEFAULT_MAX_TOKENS_ENV: &str = "SIDE_EMBEDDING_DEFAULT_MAX_TOKENS";

/// Gate for tests that touch the network or external toolchains.
pub const INTEGRATION_TEST_ENV: &str = "SIDE_INTEGRATION_TEST";

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct SidekickConfig {
    /// Base directory for worktrees and persisted data
    /// (`$SIDE_DATA_HOME`, falling back to `<data dir>/sidekick`).
    pub data_home: PathBuf,
    /// Log level filter derived from `SIDE_LOG_LEVEL`.
    pub log_level: LevelFilter,
}

impl SidekickConfig {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let data_home = match std::env::var_os(DATA_HOME_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => {
                let strategy = etcetera::choose_base_strategy()
                    .context("Failed to determine base directories")?;
                strategy.data_dir().join("sidekick")
            }
        };

        let log_level = match std::env::var(LOG_LEVEL_ENV) {
            Ok(raw) => {
                let level: i8 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{LOG_LEVEL_ENV} must be an integer, got '{raw}'"))?;
                level_filter_from_int(level)
            }
            Err(_) => LevelFilter::Info,
        };

        Ok(Self {
            data_home,
            log_level,
        })
    }

    /// Directory that holds every workspace's worktrees:
    /// `<data_home>/worktrees/<workspaceId>/<repo>-<branchSuffix>`.
    pub fn worktrees_dir(&self) -> PathBuf {
        self.data_home.join("worktrees")
    }

    /// Whether tests that touch the network or external toolchains should run.
    pub fn integration_tests_enabled() -> bool {
        std::env::var(INTEGRATION_TEST_ENV).is_ok_and(|v| !v.is_empty() && v != "0")
    }
}

/// Map a zerolog-style integer level to a `log` filter.
fn level_filter_from_int(level: i8) -> LevelFilter {
    match level {
        i8::MIN..=-1 => LevelFilter::Trace,
        0 => LevelFilter::Debug,
        1 => LevelFilter::Info,
        2 => LevelFilter::Warn,
        _ => LevelFilter::Error,
    }
}
