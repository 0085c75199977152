//! Slot Table Configuration
//!
//! Tables can be configured programmatically or from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `SLOT_TABLE_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SLOT_TABLE_MAX_CAPACITY` | Maximum number of live slots | 65536 |
//! | `SLOT_TABLE_MODE` | Deletion policy (`strict`/`relaxed`) | strict |
//! | `SLOT_TABLE_SALT` | Fixed stamp salt, decimal or `0x` hex | per-table |
//!
//! # Example
//!
//! ```rust,ignore
//! use slot_table::{Mode, SlotTable, SlotTableConfig};
//!
//! let config = SlotTableConfig::builder()
//!     .max_capacity(4096)
//!     .mode(Mode::Strict)
//!     .build()?;
//!
//! let streams: SlotTable<'_, Stream> = SlotTable::with_config(&config);
//! ```

use std::env;
use std::fmt;

use thiserror::Error;
use tracing::warn;

use crate::handle::MAX_INDEX;

/// Default maximum capacity.
pub const DEFAULT_MAX_CAPACITY: u32 = 1 << 16;

/// Deletion policy of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// Erase fails while any accessor to the slot is outstanding.
    #[default]
    Strict,
    /// Erase succeeds as soon as the slot is alive. Accessors are not
    /// counted, so the caller must guarantee no reader still uses an
    /// occupant after it is erased.
    Relaxed,
}

impl Mode {
    /// Parse a mode from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Some(Mode::Strict),
            "relaxed" | "unsafe" => Some(Mode::Relaxed),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Strict => "strict",
            Mode::Relaxed => "relaxed",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a slot table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTableConfig {
    /// Maximum number of slots the table may ever allocate.
    /// Default: 65536.
    pub max_capacity: u32,

    /// Deletion policy.
    /// Default: [`Mode::Strict`].
    pub mode: Mode,

    /// Salt mixed into every validation stamp.
    /// Default: `None`, which draws a distinct salt per table.
    pub salt: Option<u64>,
}

impl Default for SlotTableConfig {
    fn default() -> Self {
        Self {
            max_capacity: DEFAULT_MAX_CAPACITY,
            mode: Mode::Strict,
            salt: None,
        }
    }
}

impl SlotTableConfig {
    /// Create a new builder.
    pub fn builder() -> SlotTableConfigBuilder {
        SlotTableConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults. Invalid values are logged as
    /// warnings and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from environment variables, failing on the first
    /// value that does not parse or validate.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        Self::try_from_lookup(|name| env::var(name).ok())
    }

    /// Lenient loader over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup(ENV_MAX_CAPACITY) {
            match parse_capacity(&val) {
                Ok(capacity) => config.max_capacity = capacity,
                Err(err) => warn!("{err}; keeping {}", config.max_capacity),
            }
        }

        if let Some(val) = lookup(ENV_MODE) {
            match Mode::from_str(&val) {
                Some(mode) => config.mode = mode,
                None => warn!("ignoring {ENV_MODE}={val:?}: expected strict or relaxed"),
            }
        }

        if let Some(val) = lookup(ENV_SALT) {
            match parse_u64(&val) {
                Some(salt) => config.salt = Some(salt),
                None => warn!("ignoring {ENV_SALT}={val:?}: not an integer"),
            }
        }

        config
    }

    /// Strict loader over an arbitrary variable source.
    pub fn try_from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup(ENV_MAX_CAPACITY) {
            config.max_capacity = parse_capacity(&val)?;
        }

        if let Some(val) = lookup(ENV_MODE) {
            config.mode = Mode::from_str(&val).ok_or_else(|| ConfigError::EnvParse {
                var: ENV_MODE.into(),
                message: format!("expected strict or relaxed, got {val:?}"),
            })?;
        }

        if let Some(val) = lookup(ENV_SALT) {
            let salt = parse_u64(&val).ok_or_else(|| ConfigError::EnvParse {
                var: ENV_SALT.into(),
                message: format!("not an integer: {val:?}"),
            })?;
            config.salt = Some(salt);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_capacity".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.max_capacity > MAX_INDEX {
            return Err(ConfigError::InvalidValue {
                field: "max_capacity".into(),
                message: format!("must not exceed {MAX_INDEX}"),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },

    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParse {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },

    /// Relaxed mode was requested for a table that owns its occupants.
    #[error("relaxed mode is not available for owning tables through configuration")]
    RelaxedOwning,
}

/// Builder for [`SlotTableConfig`].
#[derive(Debug, Clone, Default)]
pub struct SlotTableConfigBuilder {
    config: SlotTableConfig,
}

impl SlotTableConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum capacity.
    pub fn max_capacity(mut self, capacity: u32) -> Self {
        self.config.max_capacity = capacity;
        self
    }

    /// Set the deletion policy.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Use a fixed stamp salt.
    pub fn salt(mut self, salt: u64) -> Self {
        self.config.salt = Some(salt);
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<SlotTableConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    ///
    /// Tables clamp out-of-range capacities, so an unchecked configuration
    /// is still usable.
    pub fn build_unchecked(self) -> SlotTableConfig {
        self.config
    }
}

const ENV_MAX_CAPACITY: &str = "SLOT_TABLE_MAX_CAPACITY";
const ENV_MODE: &str = "SLOT_TABLE_MODE";
const ENV_SALT: &str = "SLOT_TABLE_SALT";

fn parse_capacity(val: &str) -> Result<u32, ConfigError> {
    let parsed = parse_u64(val).ok_or_else(|| ConfigError::EnvParse {
        var: ENV_MAX_CAPACITY.into(),
        message: format!("not an integer: {val:?}"),
    })?;

    match u32::try_from(parsed) {
        Ok(capacity) if capacity > 0 && capacity <= MAX_INDEX => Ok(capacity),
        _ => Err(ConfigError::EnvParse {
            var: ENV_MAX_CAPACITY.into(),
            message: format!("must be between 1 and {MAX_INDEX}, got {parsed}"),
        }),
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal integer.
fn parse_u64(val: &str) -> Option<u64> {
    let val = val.trim();
    match val.strip_prefix("0x").or_else(|| val.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => val.parse().ok(),
    }
}
