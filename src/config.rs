//! Configuration for the prepared statement cache and the wait adaptors.
//!
//! Both structs can be built with setters or parsed from the query part of a
//! connection URL, e.g. `prepare_threshold=5&prepared_max=100&connect_timeout=10`.

use std::time::Duration;

use crate::error::{PgError, PgResult};

/// Default number of executions before a query is prepared.
pub const DEFAULT_PREPARE_THRESHOLD: u32 = 5;

/// Default maximum number of prepared statements per connection.
pub const DEFAULT_PREPARED_MAX: usize = 100;

// ============================================================================
// Prepare Configuration
// ============================================================================

/// Prepared statement cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareConfig {
    /// Number of times a query is executed before it is prepared.
    /// `None` disables preparing entirely.
    pub prepare_threshold: Option<u32>,
    /// Maximum number of entries tracked on the connection.
    pub prepared_max: usize,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            prepare_threshold: Some(DEFAULT_PREPARE_THRESHOLD),
            prepared_max: DEFAULT_PREPARED_MAX,
        }
    }
}

impl PrepareConfig {
    /// Configuration that never prepares.
    pub fn disabled() -> Self {
        Self {
            prepare_threshold: None,
            ..Self::default()
        }
    }

    /// Set the prepare threshold (`None` disables preparing).
    pub fn prepare_threshold(mut self, threshold: Option<u32>) -> Self {
        self.prepare_threshold = threshold;
        self
    }

    /// Set the maximum number of cached entries.
    pub fn prepared_max(mut self, max: usize) -> Self {
        self.prepared_max = max;
        self
    }

    /// Parse `prepare_threshold` and `prepared_max` from a `key=value&...`
    /// string. Unknown keys are ignored.
    pub fn from_params(params: &str) -> PgResult<Self> {
        let mut config = Self::default();
        for (key, value) in split_params(params) {
            match key {
                "prepare_threshold" => {
                    config.prepare_threshold = if value.eq_ignore_ascii_case("none") {
                        None
                    } else {
                        Some(parse_number(key, value)?)
                    };
                }
                "prepared_max" => config.prepared_max = parse_number(key, value)?,
                _ => {}
            }
        }
        Ok(config)
    }
}

// ============================================================================
// Wait Configuration
// ============================================================================

/// Per-call timeouts handed to the wait adaptors.
///
/// Nothing here is stored on a driver or adaptor; the caller passes the
/// values along on every call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitConfig {
    /// Polling slice for steady-state waits, so the caller can check for
    /// interrupts. `None` blocks until ready.
    pub timeout: Option<Duration>,
    /// Deadline for each readiness event while establishing a connection.
    /// `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
}

impl WaitConfig {
    /// Set the steady-state polling slice.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the connection establishment timeout.
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Parse `wait_timeout` and `connect_timeout` (seconds, fractions
    /// allowed) from a `key=value&...` string. Unknown keys are ignored.
    pub fn from_params(params: &str) -> PgResult<Self> {
        let mut config = Self::default();
        for (key, value) in split_params(params) {
            match key {
                "wait_timeout" => config.timeout = parse_seconds(key, value)?,
                "connect_timeout" => config.connect_timeout = parse_seconds(key, value)?,
                _ => {}
            }
        }
        Ok(config)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn split_params(params: &str) -> impl Iterator<Item = (&str, &str)> {
    let params = params.strip_prefix('?').unwrap_or(params);
    params
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.find('=') {
            Some(eq_pos) => (&pair[..eq_pos], &pair[eq_pos + 1..]),
            None => (pair, ""),
        })
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> PgResult<T> {
    value
        .parse::<T>()
        .map_err(|_| PgError::Config(format!("Invalid {}: {}", key, value)))
}

/// Zero or negative means "no timeout", like libpq's `connect_timeout`.
fn parse_seconds(key: &str, value: &str) -> PgResult<Option<Duration>> {
    let secs: f64 = parse_number(key, value)?;
    if !secs.is_finite() {
        return Err(PgError::Config(format!("Invalid {}: {}", key, value)));
    }
    if secs <= 0.0 {
        Ok(None)
    } else {
        Ok(Some(Duration::from_secs_f64(secs)))
    }
}
