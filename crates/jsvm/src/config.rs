//! Pool and engine configuration.
//!
//! Configuration is plain serde data so it can live in a TOML file next to the
//! host application:
//!
//! ```toml
//! capacity = 4
//! thread_name = "jsvm"
//!
//! [engine]
//! memory_limit = 67108864
//! max_stack_size = 1048576
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rquickjs::Ctx;
use serde::{Deserialize, Serialize};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Pool capacity must be at least 1")]
    InvalidCapacity,
}

/// Limits applied to every engine instance when it is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Heap limit in bytes.
    #[serde(default)]
    pub memory_limit: Option<usize>,
    /// Native stack limit in bytes.
    #[serde(default)]
    pub max_stack_size: Option<usize>,
    /// Allocation threshold that triggers a collection.
    #[serde(default)]
    pub gc_threshold: Option<usize>,
}

/// Configuration for a [`ContextPool`](crate::ContextPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
    #[serde(default)]
    pub engine: EngineOptions,
}

fn default_capacity() -> usize {
    4
}

fn default_thread_name() -> String {
    "jsvm".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            thread_name: default_thread_name(),
            engine: EngineOptions::default(),
        }
    }
}

impl PoolConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidCapacity);
        }
        Ok(())
    }

    /// The engine factory described by this configuration.
    pub fn factory(&self) -> EngineFactory {
        EngineFactory::new(self.engine.clone()).thread_name(self.thread_name.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Factory
// ─────────────────────────────────────────────────────────────────────────────

/// Hook run against every JavaScript context an engine creates.
pub type ContextSetup = Arc<dyn for<'js> Fn(&Ctx<'js>) -> rquickjs::Result<()> + Send + Sync>;

/// Describes how execution contexts build their engine.
///
/// The engine itself is created lazily on the owning thread, so the factory
/// only carries `Send` data: limits, the worker thread name and an optional
/// setup hook used to install globals.
#[derive(Clone)]
pub struct EngineFactory {
    pub(crate) options: EngineOptions,
    pub(crate) thread_name: String,
    pub(crate) setup: Option<ContextSetup>,
}

impl EngineFactory {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            thread_name: default_thread_name(),
            setup: None,
        }
    }

    /// Prefix for worker thread names.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Run `setup` on every context created by engines from this factory.
    pub fn with_setup<F>(mut self, setup: F) -> Self
    where
        F: for<'js> Fn(&Ctx<'js>) -> rquickjs::Result<()> + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(setup));
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }
}

impl Default for EngineFactory {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl fmt::Debug for EngineFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineFactory")
            .field("options", &self.options)
            .field("thread_name", &self.thread_name)
            .field("setup", &self.setup.is_some())
            .finish()
    }
}
