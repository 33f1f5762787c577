//! Environment-driven configuration.
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `POSTS_ADDR` | `[::]:8001` | children (posts) service address |
//! | `THREADS_ADDR` | `[::]:8002` | parents (threads) service address |
//! | `BATCH_WINDOW_US` | `1000` | coalescing window, microseconds |
//! | `BATCH_MAX_SIZE` | `100` | calls that dispatch a batch early |
//! | `EXCHANGE_TIMEOUT_MS` | `10000` | per-exchange deadline, `0` disables |
//! | `POSTS_STRATEGY` | `set` | grouped lookup: `set` or `fanout` |
//! | `POSTS_FANOUT` | `16` | concurrent queries for `fanout` |
//! | `SEED_PARENTS` | `100` | parents in the demo store |
//! | `SEED_CHILDREN` | `20` | children per parent in the demo store |

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::storage::{self, LookupStrategy};

pub const DEFAULT_POSTS_ADDR: &str = "[::]:8001";
pub const DEFAULT_THREADS_ADDR: &str = "[::]:8002";

/// Tuning for a [`Loader`](crate::Loader).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// How long a batch stays open after its first key.
    pub window: Duration,
    /// A batch holding this many calls is dispatched without waiting for its window.
    pub max_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { window: Duration::from_millis(1), max_batch_size: 100 }
    }
}

impl BatchConfig {
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }
}

/// Configuration shared by the gateway demo and the backend binaries.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub posts_addr: String,
    pub threads_addr: String,
    pub batch: BatchConfig,
    pub exchange_timeout: Option<Duration>,
    pub lookup_strategy: LookupStrategy,
    pub seed_parents: usize,
    pub seed_children: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            posts_addr: DEFAULT_POSTS_ADDR.to_owned(),
            threads_addr: DEFAULT_THREADS_ADDR.to_owned(),
            batch: BatchConfig::default(),
            exchange_timeout: Some(Duration::from_secs(10)),
            lookup_strategy: LookupStrategy::SetMembership,
            seed_parents: 100,
            seed_children: 20,
        }
    }
}

impl Config {
    /// Reads the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through `lookup`, falling back to defaults for
    /// unset variables.
    pub fn from_lookup<L>(lookup: L) -> Result<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let window_us: u64 = parse(&lookup, "BATCH_WINDOW_US", 1_000)?;
        let max_batch_size: usize =
            parse(&lookup, "BATCH_MAX_SIZE", defaults.batch.max_batch_size)?;
        let timeout_ms: u64 = parse(&lookup, "EXCHANGE_TIMEOUT_MS", 10_000)?;

        let lookup_strategy = match lookup("POSTS_STRATEGY").as_deref() {
            None | Some("set") => LookupStrategy::SetMembership,
            Some("fanout") => {
                LookupStrategy::FanOut { concurrency: parse(&lookup, "POSTS_FANOUT", 16)? }
            }
            Some(other) => {
                return Err(Error::Config {
                    name: "POSTS_STRATEGY",
                    value: other.to_owned(),
                    message: "expected `set` or `fanout`".to_owned(),
                })
            }
        };

        let seed_parents = parse(&lookup, "SEED_PARENTS", defaults.seed_parents)?;
        let seed_children = parse(&lookup, "SEED_CHILDREN", defaults.seed_children)?;
        if !storage::synthetic_fits(seed_parents, seed_children) {
            return Err(Error::Config {
                name: "SEED_PARENTS",
                value: seed_parents.to_string(),
                message: format!(
                    "{} parents with {} children each exceed the id range",
                    seed_parents, seed_children
                ),
            });
        }

        Ok(Self {
            posts_addr: lookup("POSTS_ADDR").unwrap_or(defaults.posts_addr),
            threads_addr: lookup("THREADS_ADDR").unwrap_or(defaults.threads_addr),
            batch: BatchConfig::default()
                .with_window(Duration::from_micros(window_us))
                .with_max_batch_size(max_batch_size),
            exchange_timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            lookup_strategy,
            seed_parents,
            seed_children,
        })
    }
}

fn parse<L, T>(lookup: &L, name: &'static str, default: T) -> Result<T>
where
    L: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| Error::Config {
            name,
            message: e.to_string(),
            value,
        }),
    }
}
