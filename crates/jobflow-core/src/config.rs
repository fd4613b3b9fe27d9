//! Execution configuration and the config guard
//!
//! - [`ExecutionConfig`]: typed `[execution]` section (mode, worker count)
//! - [`ConfigHandle`]: shared, guarded configuration visible to work units
//! - [`ConfigGuard`]: scope during which configuration mutation is refused
//!
//! Pool workers never share a handle with the coordinator. They rebuild one
//! from [`ConfigHandle::snapshot`] and engage their own guard.

use crate::error::{ConfigError, DispatchError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default worker count for pooled execution
pub const DEFAULT_MAX_WORKERS: usize = 2;

/// How runnable jobs are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// Synchronously on the submitting thread
    Inline,
    /// On a bounded pool of worker threads
    Pooled,
}

impl FromStr for ExecutionMode {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" | "development" => Ok(Self::Inline),
            "pooled" | "standalone" => Ok(Self::Pooled),
            other => Err(DispatchError::ModeNotAvailable(other.to_string())),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline => f.write_str("inline"),
            Self::Pooled => f.write_str("pooled"),
        }
    }
}

/// `[execution]` configuration section
///
/// `mode` stays a string until the dispatcher is built, so an unknown mode
/// is reported at construction time rather than while parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// `inline` or `pooled`
    pub mode: String,
    /// Pool size in pooled mode
    pub max_workers: usize,
}

impl ExecutionConfig {
    /// Inline execution
    #[inline]
    #[must_use]
    pub fn inline() -> Self {
        Self::default()
    }

    /// Pooled execution with `max_workers` workers
    #[inline]
    #[must_use]
    pub fn pooled(max_workers: usize) -> Self {
        Self {
            mode: ExecutionMode::Pooled.to_string(),
            max_workers,
        }
    }

    /// Parse from a TOML document containing an `[execution]` table
    ///
    /// # Errors
    /// `ConfigError::Parse` on malformed TOML
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        SharedConfig::from_toml_str(source).map(|c| c.execution)
    }

    /// Validate and resolve the configured mode
    ///
    /// # Errors
    /// - `DispatchError::ModeNotAvailable` for unknown modes
    /// - `DispatchError::InvalidWorkerCount` for a pool without workers
    pub fn resolve_mode(&self) -> Result<ExecutionMode, DispatchError> {
        let mode = self.mode.parse::<ExecutionMode>()?;
        if mode == ExecutionMode::Pooled && self.max_workers == 0 {
            return Err(DispatchError::InvalidWorkerCount(self.max_workers));
        }
        Ok(mode)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Inline.to_string(),
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

/// Supplies the execution section when a dispatcher is built
pub trait ConfigProvider: Send + Sync {
    /// Current execution configuration
    fn execution(&self) -> ExecutionConfig;
}

impl ConfigProvider for ExecutionConfig {
    fn execution(&self) -> ExecutionConfig {
        self.clone()
    }
}

/// Configuration shared with work units
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Execution section
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Free-form properties readable by work units
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl SharedConfig {
    /// Parse from TOML
    ///
    /// # Errors
    /// `ConfigError::Parse` on malformed TOML
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize to TOML
    ///
    /// # Errors
    /// `ConfigError::Serialize` if the document cannot be rendered
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }
}

/// Shared configuration with a mutation guard
///
/// Clones share both the configuration and the guard.
#[derive(Debug, Clone, Default)]
pub struct ConfigHandle {
    inner: Arc<RwLock<SharedConfig>>,
    guard: Arc<AtomicUsize>,
}

impl ConfigHandle {
    /// Create handle over `config`
    #[must_use]
    pub fn new(config: SharedConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            guard: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Copy of the current configuration
    #[must_use]
    pub fn read(&self) -> SharedConfig {
        self.inner.read().clone()
    }

    /// Look up a property
    #[must_use]
    pub fn property(&self, key: &str) -> Option<String> {
        self.inner.read().properties.get(key).cloned()
    }

    /// Set a property
    ///
    /// # Errors
    /// `ConfigError::MutationBlocked` while the guard is engaged
    pub fn set_property(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ConfigError> {
        let key = key.into();
        self.ensure_unguarded(&key)?;
        self.inner.write().properties.insert(key, value.into());
        Ok(())
    }

    /// Replace the execution section
    ///
    /// Takes effect for dispatchers built afterwards.
    ///
    /// # Errors
    /// `ConfigError::MutationBlocked` while the guard is engaged
    pub fn set_execution(&self, execution: ExecutionConfig) -> Result<(), ConfigError> {
        self.ensure_unguarded("execution")?;
        self.inner.write().execution = execution;
        Ok(())
    }

    /// Whether dispatched work is currently running against this handle
    #[inline]
    #[must_use]
    pub fn is_guarded(&self) -> bool {
        self.guard.load(Ordering::SeqCst) > 0
    }

    /// Engage the guard until the returned value is dropped
    #[must_use = "the guard is released as soon as it is dropped"]
    pub fn guard(&self) -> ConfigGuard {
        self.guard.fetch_add(1, Ordering::SeqCst);
        ConfigGuard {
            counter: Arc::clone(&self.guard),
        }
    }

    /// Serialize for a worker
    ///
    /// # Errors
    /// `ConfigError::Serialize` if the config cannot be rendered
    pub fn snapshot(&self) -> Result<String, ConfigError> {
        self.inner.read().to_toml_string()
    }

    /// Rebuild a fresh, unguarded handle from a snapshot
    ///
    /// # Errors
    /// `ConfigError::Parse` on a malformed snapshot
    pub fn from_snapshot(snapshot: &str) -> Result<Self, ConfigError> {
        SharedConfig::from_toml_str(snapshot).map(Self::new)
    }

    fn ensure_unguarded(&self, key: &str) -> Result<(), ConfigError> {
        if self.is_guarded() {
            tracing::warn!(key, "configuration mutation refused while jobs run");
            return Err(ConfigError::MutationBlocked {
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

impl ConfigProvider for ConfigHandle {
    fn execution(&self) -> ExecutionConfig {
        self.inner.read().execution.clone()
    }
}

/// Scope during which configuration mutation is refused
///
/// Counted, so overlapping inline dispatches on several threads keep the
/// guard engaged until the last one leaves.
#[derive(Debug)]
pub struct ConfigGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConfigGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
