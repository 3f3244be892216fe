use crate::core::{DbError, Result};
use crate::storage::DurabilityMode;
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;

const URL_SCHEME: &str = "changeledger://";

/// Ledger configuration
///
/// Built either field by field or from a connection string:
/// `changeledger:///var/lib/ledger?durability=sync&window=5000`
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    /// Directory for the WAL and checkpoints; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,

    pub durability: DurabilityMode,

    /// How long a writer waits for a row lock before giving up
    pub lock_wait_timeout: Duration,

    /// Target number of rows per change-number window when polling unsent
    /// messages
    pub unsent_window_size: u64,

    /// WAL entries between automatic checkpoints
    pub checkpoint_threshold: usize,

    /// Change numbers reserved per WAL record
    pub sequence_reserve_block: i64,

    /// Maximum number of connections in pool
    pub max_connections: usize,

    /// How long to wait for a pooled connection
    pub connect_timeout: Duration,

    /// Minimum age of a change before a dispatcher publishes it; zero
    /// publishes immediately
    pub dispatch_settle_delay: Duration,
}

impl LedgerConfig {
    pub fn new() -> Self {
        Self {
            data_dir: None,
            durability: DurabilityMode::default(),
            lock_wait_timeout: Duration::from_secs(5),
            unsent_window_size: 10_000,
            checkpoint_threshold: 1000,
            sequence_reserve_block: 1000,
            max_connections: 10,
            connect_timeout: Duration::from_secs(30),
            dispatch_settle_delay: Duration::ZERO,
        }
    }

    /// Set the data directory
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    pub fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    pub fn unsent_window_size(mut self, rows: u64) -> Self {
        self.unsent_window_size = rows;
        self
    }

    pub fn checkpoint_threshold(mut self, entries: usize) -> Self {
        self.checkpoint_threshold = entries;
        self
    }

    pub fn sequence_reserve_block(mut self, block: i64) -> Self {
        self.sequence_reserve_block = block;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn dispatch_settle_delay(mut self, delay: Duration) -> Self {
        self.dispatch_settle_delay = delay;
        self
    }

    /// True when commits are written to a WAL.
    pub fn is_persistent(&self) -> bool {
        self.data_dir.is_some() && self.durability != DurabilityMode::None
    }

    /// Parse from connection string
    ///
    /// Format: `changeledger://[/data/dir][?key=value&...]`, keys being
    /// `durability`, `window`, `lock_timeout_ms`, `checkpoint`, `reserve`,
    /// `max_connections`, `connect_timeout_ms` and `settle_ms`. An empty path means
    /// memory only.
    ///
    /// # Examples
    ///
    /// ```
    /// use changeledger::LedgerConfig;
    ///
    /// let config = LedgerConfig::from_url("changeledger:///tmp/ledger?durability=sync&window=5000").unwrap();
    /// assert_eq!(config.unsent_window_size, 5000);
    /// ```
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url.strip_prefix(URL_SCHEME).ok_or_else(|| {
            DbError::InvalidArgument(format!("URL must start with '{}'", URL_SCHEME))
        })?;

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let mut config = Self::new();
        if !path.is_empty() {
            config.data_dir = Some(PathBuf::from(path));
        }

        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                DbError::InvalidArgument(format!("Invalid URL parameter: {}", pair))
            })?;
            match key {
                "durability" => config.durability = value.parse()?,
                "window" => config.unsent_window_size = parse_number(key, value)?,
                "lock_timeout_ms" => {
                    config.lock_wait_timeout = Duration::from_millis(parse_number(key, value)?)
                }
                "checkpoint" => config.checkpoint_threshold = parse_number(key, value)?,
                "reserve" => config.sequence_reserve_block = parse_number(key, value)?,
                "max_connections" => config.max_connections = parse_number(key, value)?,
                "connect_timeout_ms" => {
                    config.connect_timeout = Duration::from_millis(parse_number(key, value)?)
                }
                "settle_ms" => {
                    config.dispatch_settle_delay = Duration::from_millis(parse_number(key, value)?)
                }
                other => {
                    return Err(DbError::InvalidArgument(format!(
                        "Unknown URL parameter: {}",
                        other
                    )));
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Convert to connection string
    pub fn to_url(&self) -> String {
        let path = self
            .data_dir
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        format!(
            "{}{}?durability={}&window={}&lock_timeout_ms={}&checkpoint={}&reserve={}&max_connections={}&connect_timeout_ms={}&settle_ms={}",
            URL_SCHEME,
            path,
            self.durability,
            self.unsent_window_size,
            self.lock_wait_timeout.as_millis(),
            self.checkpoint_threshold,
            self.sequence_reserve_block,
            self.max_connections,
            self.connect_timeout.as_millis(),
            self.dispatch_settle_delay.as_millis()
        )
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.unsent_window_size == 0 {
            return Err(DbError::InvalidArgument(
                "unsent_window_size must be > 0".to_string(),
            ));
        }

        if self.checkpoint_threshold == 0 {
            return Err(DbError::InvalidArgument(
                "checkpoint_threshold must be > 0".to_string(),
            ));
        }

        if self.sequence_reserve_block <= 0 {
            return Err(DbError::InvalidArgument(
                "sequence_reserve_block must be > 0".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(DbError::InvalidArgument(
                "max_connections must be > 0".to_string(),
            ));
        }

        if self.lock_wait_timeout.is_zero() {
            return Err(DbError::InvalidArgument(
                "lock_wait_timeout must be > 0".to_string(),
            ));
        }

        settle_window(self.dispatch_settle_delay)?;

        Ok(())
    }
}

/// Converts a dispatch settle delay into a span that can be subtracted
/// from the current time.
pub(crate) fn settle_window(delay: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(delay)
        .ok()
        .filter(|window| Utc::now().checked_sub_signed(*window).is_some())
        .ok_or_else(|| {
            DbError::InvalidArgument(format!(
                "dispatch_settle_delay out of range: {:?}",
                delay
            ))
        })
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        DbError::InvalidArgument(format!("Invalid value for {}: {}", key, value))
    })
}
