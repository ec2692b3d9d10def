//! Configuration loading for redsync deployments
//!
//! Settings come from an optional file (YAML, TOML or JSON, picked by
//! extension) overlaid with `REDSYNC_*` environment variables, nested keys
//! separated by `__`:
//!
//! | Key                  | Environment                   | Default            |
//! |----------------------|-------------------------------|--------------------|
//! | `nodes`              | `REDSYNC_NODES` (comma list)  | (required)         |
//! | `serialize_calls`    | `REDSYNC_SERIALIZE_CALLS`     | `false`            |
//! | `mutex.profile`      | `REDSYNC_MUTEX__PROFILE`      | `blocking`         |
//! | `mutex.expiry_ms`    | `REDSYNC_MUTEX__EXPIRY_MS`    | preset             |
//! | `mutex.tries`        | `REDSYNC_MUTEX__TRIES`        | preset             |
//! | `mutex.delay_ms`     | `REDSYNC_MUTEX__DELAY_MS`     | preset             |
//! | `mutex.drift_factor` | `REDSYNC_MUTEX__DRIFT_FACTOR` | preset             |

use std::sync::Arc;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::de::DeserializeOwned;
use tracing::info;

use crate::error::{RedsyncError, Result};
use crate::factory::Redsync;
use crate::node::{NodeRef, RedisNode};
use crate::options::{MutexOptions, Profile};

pub const NODES: &str = "nodes";
pub const SERIALIZE_CALLS: &str = "serialize_calls";
pub const MUTEX_PROFILE: &str = "mutex.profile";
pub const MUTEX_EXPIRY_MS: &str = "mutex.expiry_ms";
pub const MUTEX_TRIES: &str = "mutex.tries";
pub const MUTEX_DELAY_MS: &str = "mutex.delay_ms";
pub const MUTEX_DRIFT_FACTOR: &str = "mutex.drift_factor";

/// Redsync configuration loaded from file and environment
#[derive(Clone, Debug, Default)]
pub struct RedsyncConfig {
    pub config: Config,
}

impl RedsyncConfig {
    /// Load configuration, reading `path` if given
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("REDSYNC")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key(NODES)
                .try_parsing(true),
        );

        Ok(Self {
            config: builder.build()?,
        })
    }

    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Redis URLs of the quorum nodes
    pub fn nodes(&self) -> Result<Vec<String>> {
        let nodes: Vec<String> = self.optional(NODES)?.unwrap_or_default();
        if nodes.is_empty() {
            return Err(RedsyncError::InvalidArgument(format!(
                "'{}' must list at least one node",
                NODES
            )));
        }
        Ok(nodes)
    }

    pub fn serialize_calls(&self) -> Result<bool> {
        Ok(self.optional(SERIALIZE_CALLS)?.unwrap_or(false))
    }

    pub fn profile(&self) -> Result<Profile> {
        Ok(self.optional::<Profile>(MUTEX_PROFILE)?.unwrap_or_default())
    }

    /// Profile preset with any explicit overrides applied, validated
    pub fn mutex_options(&self) -> Result<MutexOptions> {
        let mut opts = MutexOptions::from(self.profile()?);

        if let Some(ms) = self.optional::<u64>(MUTEX_EXPIRY_MS)? {
            opts.expiry = Duration::from_millis(ms);
        }
        if let Some(tries) = self.optional::<u32>(MUTEX_TRIES)? {
            opts.tries = tries;
        }
        if let Some(ms) = self.optional::<u64>(MUTEX_DELAY_MS)? {
            opts.delay = Duration::from_millis(ms);
        }
        if let Some(factor) = self.optional::<f64>(MUTEX_DRIFT_FACTOR)? {
            opts.factor = factor;
        }

        opts.validate()?;
        Ok(opts)
    }

    /// Connect to every configured node and build a factory over them
    pub async fn connect(&self) -> Result<Redsync> {
        let mut nodes: Vec<NodeRef> = Vec::new();
        for url in self.nodes()? {
            let node = RedisNode::connect(&url)
                .await
                .map_err(|source| RedsyncError::Node {
                    node: url.clone(),
                    source,
                })?;
            nodes.push(Arc::new(node));
        }

        let redsync = Redsync::new(nodes)?;
        let redsync = if self.serialize_calls()? {
            redsync.serialized()
        } else {
            redsync
        };

        info!(
            nodes = redsync.nodes().len(),
            quorum = redsync.quorum(),
            "Connected to lock nodes"
        );
        Ok(redsync)
    }

    fn optional<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.config.get::<T>(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
