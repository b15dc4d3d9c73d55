//! Configuration for dirpoll
//!
//! Three layers, later wins:
//! - built-in defaults
//! - optional TOML config file (`--config`)
//! - command-line flags and `DIRPOLL_*` environment variables

use crate::backlog::{BatchLimit, UNBOUNDED_SENTINEL};
use crate::error::ConfigError;
use crate::source::pool::DEFAULT_MAX_CONNECTIONS;
use clap::Parser;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default time between poll cycles
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Settings owned by one poller instance.
///
/// Only constructible through [`PollerConfig::new`] and the `with_*`
/// builders, so every value has passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    max_batch_size: BatchLimit,
    retrieve_concurrency: NonZeroUsize,
    allow_overlap: bool,
    // Never zero: tokio's interval panics on a zero period
    poll_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: BatchLimit::Unbounded,
            retrieve_concurrency: NonZeroUsize::MIN,
            allow_overlap: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl PollerConfig {
    /// Build a config with the given batch size; `-1` means unbounded.
    ///
    /// Zero and other negative values are rejected.
    pub fn new(max_batch_size: i64) -> Result<Self, ConfigError> {
        Ok(Self {
            max_batch_size: BatchLimit::from_raw(max_batch_size)?,
            ..Self::default()
        })
    }

    pub fn with_retrieve_concurrency(mut self, concurrency: usize) -> Result<Self, ConfigError> {
        self.retrieve_concurrency = NonZeroUsize::new(concurrency).ok_or(ConfigError::Zero {
            field: "retrieve_concurrency",
        })?;
        Ok(self)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "poll_interval",
            });
        }
        self.poll_interval = interval;
        Ok(self)
    }

    pub fn with_allow_overlap(mut self, allow: bool) -> Self {
        self.allow_overlap = allow;
        self
    }

    /// Entries selected per cycle
    pub fn max_batch_size(&self) -> BatchLimit {
        self.max_batch_size
    }

    /// Retrievals in flight at once within a cycle
    pub fn retrieve_concurrency(&self) -> NonZeroUsize {
        self.retrieve_concurrency
    }

    /// Let a cycle start listing before the previous one finished selecting
    pub fn allow_overlap(&self) -> bool {
        self.allow_overlap
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Contents of a TOML config file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub source_dir: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub max_batch_size: Option<i64>,
    pub poll_interval_ms: Option<u64>,
    pub retrieve_concurrency: Option<usize>,
    pub max_connections: Option<usize>,
    pub allow_overlap: Option<bool>,
}

impl FileConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

/// Poll a directory and move new or changed files into a working directory
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "dirpoll",
    version,
    about = "Poll a directory and ingest new or changed files exactly once per version",
    after_help = "EXAMPLES:\n    \
        dirpoll /srv/inbox ./work\n    \
        dirpoll /srv/inbox ./work -b 50 -i 2000\n    \
        dirpoll --config poll.toml --once"
)]
pub struct Cli {
    /// Directory to poll
    #[arg(value_name = "SOURCE", env = "DIRPOLL_SOURCE")]
    pub source: Option<PathBuf>,

    /// Directory that receives retrieved files
    #[arg(value_name = "WORKDIR", env = "DIRPOLL_WORKDIR")]
    pub workdir: Option<PathBuf>,

    /// TOML config file
    #[arg(short, long, value_name = "FILE", env = "DIRPOLL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Files per dispatch unit (-1 for unbounded)
    #[arg(short = 'b', long, value_name = "N", allow_hyphen_values = true)]
    pub max_batch_size: Option<i64>,

    /// Milliseconds between poll cycles
    #[arg(short = 'i', long = "interval-ms", value_name = "MS")]
    pub interval_ms: Option<u64>,

    /// Concurrent retrievals per cycle
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Maximum open source clients
    #[arg(long, value_name = "N")]
    pub max_connections: Option<usize>,

    /// Allow poll cycles to overlap
    #[arg(long)]
    pub allow_overlap: bool,

    /// Run a single cycle, print the report as JSON and exit
    #[arg(long)]
    pub once: bool,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Fully resolved runtime settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub source_dir: PathBuf,
    pub working_dir: PathBuf,
    pub poller: PollerConfig,
    pub max_connections: usize,
    pub once: bool,
}

impl Settings {
    /// Merge CLI flags over the config file (if any) over defaults
    pub async fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(&expand_tilde(path)).await?,
            None => FileConfig::default(),
        };
        Self::merge(cli, file)
    }

    pub fn merge(cli: &Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let source_dir = cli
            .source
            .clone()
            .or(file.source_dir)
            .ok_or(ConfigError::Missing("source_dir"))?;
        let working_dir = cli
            .workdir
            .clone()
            .or(file.working_dir)
            .ok_or(ConfigError::Missing("working_dir"))?;

        let max_batch_size = cli
            .max_batch_size
            .or(file.max_batch_size)
            .unwrap_or(UNBOUNDED_SENTINEL);
        let interval_ms = cli
            .interval_ms
            .or(file.poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_INTERVAL.as_millis() as u64);
        let concurrency = cli
            .concurrency
            .or(file.retrieve_concurrency)
            .unwrap_or(1);

        let poller = PollerConfig::new(max_batch_size)?
            .with_retrieve_concurrency(concurrency)?
            .with_poll_interval(Duration::from_millis(interval_ms))?
            .with_allow_overlap(cli.allow_overlap || file.allow_overlap.unwrap_or(false));

        let max_connections = cli
            .max_connections
            .or(file.max_connections)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            return Err(ConfigError::Zero {
                field: "max_connections",
            });
        }

        Ok(Self {
            source_dir: expand_tilde(&source_dir),
            working_dir: expand_tilde(&working_dir),
            poller,
            max_connections,
            once: cli.once,
        })
    }
}

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            home.join(rest)
        } else {
            path.to_path_buf()
        }
    } else {
        path.to_path_buf()
    }
}
