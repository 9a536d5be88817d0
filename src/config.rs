use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How often a list refetches its head page when asked for its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RefreshRepr", into = "RefreshRepr")]
pub enum RefreshInterval {
    /// Refetch once this much time has passed since the last head fetch.
    Every(Duration),
    /// Fetch the head once and keep it for the lifetime of the list.
    Never,
}

impl RefreshInterval {
    /// Shorthand for `RefreshInterval::Every(Duration::from_secs(secs))`.
    pub const fn seconds(secs: u64) -> RefreshInterval {
        RefreshInterval::Every(Duration::from_secs(secs))
    }

    /// Returns `true` if a head fetched `elapsed` ago is due for a refetch.
    pub fn is_due(&self, elapsed: Duration) -> bool {
        match self {
            RefreshInterval::Every(interval) => elapsed >= *interval,
            RefreshInterval::Never => false,
        }
    }
}

impl Default for RefreshInterval {
    fn default() -> RefreshInterval {
        RefreshInterval::seconds(60)
    }
}

impl fmt::Display for RefreshInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshInterval::Every(d) => write!(f, "{}", d.as_secs_f64()),
            RefreshInterval::Never => f.write_str("never"),
        }
    }
}

fn seconds_to_interval(secs: f64) -> Result<RefreshInterval> {
    Duration::try_from_secs_f64(secs).map(RefreshInterval::Every).map_err(|_| {
        Error::InvalidInput(format!(
            "refresh interval must be a non-negative number of seconds \
             that fits a Duration, got {}",
            secs
        ))
    })
}

impl FromStr for RefreshInterval {
    type Err = Error;

    fn from_str(s: &str) -> Result<RefreshInterval> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("never") {
            return Ok(RefreshInterval::Never);
        }
        let secs: f64 = s.parse().map_err(|_| {
            Error::InvalidInput(format!(
                "refresh interval must be a number of seconds or \"never\", \
                 got {:?}",
                s
            ))
        })?;
        seconds_to_interval(secs)
    }
}

// a number of seconds, or the word "never"
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RefreshRepr {
    Seconds(f64),
    Word(String),
}

impl TryFrom<RefreshRepr> for RefreshInterval {
    type Error = Error;

    fn try_from(repr: RefreshRepr) -> Result<RefreshInterval> {
        match repr {
            RefreshRepr::Seconds(secs) => seconds_to_interval(secs),
            RefreshRepr::Word(word) => word.parse(),
        }
    }
}

impl From<RefreshInterval> for RefreshRepr {
    fn from(interval: RefreshInterval) -> RefreshRepr {
        match interval {
            RefreshInterval::Every(d) => RefreshRepr::Seconds(d.as_secs_f64()),
            RefreshInterval::Never => RefreshRepr::Word("never".into()),
        }
    }
}

/// Top-level configuration for a [`List`](crate::List).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long a fetched head stays fresh. Reads of the start of the
    /// list after this interval refetch the head and splice it onto the
    /// previously loaded data. Defaults to 60 seconds.
    pub refresh_interval: RefreshInterval,
}

impl Config {
    /// Returns a default `Config`
    pub fn new() -> Config {
        Config::default()
    }

    /// Set how often the head is refetched.
    pub fn refresh_interval(mut self, to: RefreshInterval) -> Config {
        self.refresh_interval = to;
        self
    }
}
