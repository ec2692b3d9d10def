//! Mutex acquisition options and the named presets

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RedsyncError, Result};

/// Default lease duration shared by both presets
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(8);

/// Default clock drift factor (1% of the lease)
pub const DEFAULT_DRIFT_FACTOR: f64 = 0.01;

/// Longest accepted lease (`i32::MAX` milliseconds, about 24.8 days)
pub const MAX_EXPIRY: Duration = Duration::from_millis(i32::MAX as u64);

/// Options for mutex construction
///
/// In general callers start from [`MutexOptions::blocking`] or
/// [`MutexOptions::non_blocking`] and customize the result.
#[derive(Debug, Clone, PartialEq)]
pub struct MutexOptions {
    /// Time before the lock expires at each node, even if never released
    pub expiry: Duration,
    /// Number of acquisition attempts
    pub tries: u32,
    /// Pause between attempts
    pub delay: Duration,
    /// Clock drift factor subtracted from the lease
    pub factor: f64,
}

impl Default for MutexOptions {
    fn default() -> Self {
        Self::blocking()
    }
}

impl MutexOptions {
    /// Options for a mutex that keeps retrying for up to ~16 seconds
    pub fn blocking() -> Self {
        Self {
            expiry: DEFAULT_EXPIRY,
            tries: 32,
            delay: Duration::from_millis(500),
            factor: DEFAULT_DRIFT_FACTOR,
        }
    }

    /// Options for a mutex that gives up after the first failed attempt
    pub fn non_blocking() -> Self {
        Self {
            expiry: DEFAULT_EXPIRY,
            tries: 1,
            delay: Duration::from_millis(10),
            factor: DEFAULT_DRIFT_FACTOR,
        }
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Reject option sets that can never produce a valid lease
    pub fn validate(&self) -> Result<()> {
        check_expiry(self.expiry)?;
        if !self.factor.is_finite() || !(0.0..1.0).contains(&self.factor) {
            return Err(RedsyncError::InvalidArgument(format!(
                "drift factor must be in [0, 1), got {}",
                self.factor
            )));
        }
        Ok(())
    }
}

/// Expiry must be positive and no longer than [`MAX_EXPIRY`]
pub(crate) fn check_expiry(expiry: Duration) -> Result<()> {
    if expiry.is_zero() || expiry > MAX_EXPIRY {
        return Err(RedsyncError::InvalidArgument(format!(
            "expiry must be in (0, {:?}], got {:?}",
            MAX_EXPIRY, expiry
        )));
    }
    Ok(())
}

impl From<Profile> for MutexOptions {
    fn from(profile: Profile) -> Self {
        match profile {
            Profile::Blocking => Self::blocking(),
            Profile::NonBlocking => Self::non_blocking(),
        }
    }
}

/// Named option presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    #[default]
    Blocking,
    #[serde(alias = "non_blocking", alias = "nonblocking")]
    NonBlocking,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Blocking => "blocking",
            Profile::NonBlocking => "non-blocking",
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blocking" => Ok(Profile::Blocking),
            "non-blocking" | "non_blocking" | "nonblocking" => Ok(Profile::NonBlocking),
            _ => Err(format!("Invalid profile: {}", s)),
        }
    }
}
