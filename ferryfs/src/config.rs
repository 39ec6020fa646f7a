//! Engine configuration.
//!
//! An [`EngineConfig`] is built programmatically with the `with_*`
//! methods or loaded from an INI file with an `[engine]` section:
//!
//! ```text
//! [engine]
//! path_mode = cached
//! context_pool_cap = 16
//! max_frame_size = 1048576
//! ```
//!
//! Unset keys keep their defaults; unknown values are configuration
//! errors, not silent fallbacks.

use crate::error::EngineError;
use crate::registry::PathMode;
use crate::sched::DEFAULT_CONTEXT_POOL_CAP;
use crate::transport::DEFAULT_MAX_FRAME_SIZE;
use crate::wire::HEADER_LEN;
use ini::Ini;
use std::path::Path;

/// Tunable engine parameters for one mount.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path caching mode for the node registry.
    pub path_mode: PathMode,
    /// Maximum number of idle context records kept for reuse.
    pub context_pool_cap: usize,
    /// Hard cap on frame size, inbound and outbound.
    pub max_frame_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path_mode: PathMode::default(),
            context_pool_cap: DEFAULT_CONTEXT_POOL_CAP,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the path caching mode.
    pub fn with_path_mode(mut self, mode: PathMode) -> Self {
        self.path_mode = mode;
        self
    }

    /// Sets the context pool cap.
    pub fn with_context_pool_cap(mut self, cap: usize) -> Self {
        self.context_pool_cap = cap;
        self
    }

    /// Sets the maximum frame size.
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Loads configuration from an INI file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let ini = Ini::load_from_file(path)
            .map_err(|e| EngineError::Config(format!("failed to read {}: {e}", path.display())))?;

        let mut config = Self::default();
        let Some(section) = ini.section(Some("engine")) else {
            return Ok(config);
        };

        if let Some(v) = section.get("path_mode") {
            config.path_mode = match v {
                "off" => PathMode::Off,
                "cached" => PathMode::Cached,
                "hashed" => PathMode::CachedHashed,
                other => {
                    return Err(EngineError::Config(format!(
                        "unknown path_mode '{other}' (expected off, cached, or hashed)"
                    )))
                }
            };
        }
        if let Some(v) = section.get("context_pool_cap") {
            config.context_pool_cap = v.parse().map_err(|_| {
                EngineError::Config(format!("context_pool_cap '{v}' is not a number"))
            })?;
        }
        if let Some(v) = section.get("max_frame_size") {
            config.max_frame_size = v
                .parse()
                .map_err(|_| EngineError::Config(format!("max_frame_size '{v}' is not a number")))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_frame_size <= HEADER_LEN {
            return Err(EngineError::Config(format!(
                "max_frame_size {} cannot fit the {} byte header",
                self.max_frame_size, HEADER_LEN
            )));
        }
        Ok(())
    }
}
