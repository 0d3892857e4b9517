//! Reader configuration
//!
//! Key material is never compiled in. The master key and the factory
//! transport keys come from the caller or from the environment:
//!
//! | variable                     | meaning                                 |
//! |------------------------------|-----------------------------------------|
//! | `MAGSTRIPE_DEVICE`           | serial device path                      |
//! | `MAGSTRIPE_BAUD`             | 9600, 19200, 38400 or 115200            |
//! | `MAGSTRIPE_MASTER_KEY`       | Km, 32 hex characters                   |
//! | `MAGSTRIPE_FACTORY_KEY_DEV`  | development-class transport key (hex)   |
//! | `MAGSTRIPE_FACTORY_KEY_PROD` | production-class transport key (hex)    |
//! | `MAGSTRIPE_READER_CLASS`     | `development` or `production`           |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use magstripe_core::{constants::DEFAULT_COMMAND_TIMEOUT, DesKey};
use magstripe_transport::BaudRate;

use crate::error::{Error, Result};

/// Default master key backup file
pub const DEFAULT_BACKUP_FILE: &str = "MASTERKey.TXT";

#[cfg(windows)]
const DEFAULT_DEVICE: &str = "COM1";
#[cfg(not(windows))]
const DEFAULT_DEVICE: &str = "/dev/ttyS0";

/// Reader security class, selects the factory transport key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReaderClass {
    #[default]
    Development,
    Production,
}

impl FromStr for ReaderClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Development),
            "prod" | "production" => Ok(Self::Production),
            other => Err(Error::Config(format!("unknown reader class: {}", other))),
        }
    }
}

impl fmt::Display for ReaderClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// Temporary keys readers ship with, per class
#[derive(Debug, Clone, Default)]
pub struct FactoryKeys {
    pub development: Option<DesKey>,
    pub production: Option<DesKey>,
}

impl FactoryKeys {
    pub fn get(&self, class: ReaderClass) -> Option<&DesKey> {
        match class {
            ReaderClass::Development => self.development.as_ref(),
            ReaderClass::Production => self.production.as_ref(),
        }
    }
}

/// Reader configuration
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use magstripe::{DesKey, ReaderConfig};
///
/// let config = ReaderConfig::new("/dev/ttyUSB0")
///     .with_baud_rate(115200)
///     .with_command_timeout(Duration::from_secs(5))
///     .with_master_key(DesKey::from_hex("0123456789ABCDEFFEDCBA9876543210").unwrap());
///
/// assert!(config.master_key.is_some());
/// ```
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub device: String,
    pub baud_rate: u32,
    pub command_timeout: Duration,
    pub master_key: Option<DesKey>,
    pub factory_keys: FactoryKeys,
    pub reader_class: ReaderClass,
    pub backup_path: PathBuf,
}

impl ReaderConfig {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Default::default()
        }
    }

    /// Load from `MAGSTRIPE_*` environment variables
    ///
    /// Unset variables keep their defaults; malformed ones are errors.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(device) = lookup("MAGSTRIPE_DEVICE") {
            config.device = device;
        }
        if let Some(baud) = lookup("MAGSTRIPE_BAUD") {
            config.baud_rate = baud
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid MAGSTRIPE_BAUD: {}", baud)))?;
            BaudRate::try_from(config.baud_rate)?;
        }
        if let Some(text) = lookup("MAGSTRIPE_MASTER_KEY") {
            config.master_key = Some(parse_key("MAGSTRIPE_MASTER_KEY", &text)?);
        }
        if let Some(text) = lookup("MAGSTRIPE_FACTORY_KEY_DEV") {
            config.factory_keys.development = Some(parse_key("MAGSTRIPE_FACTORY_KEY_DEV", &text)?);
        }
        if let Some(text) = lookup("MAGSTRIPE_FACTORY_KEY_PROD") {
            config.factory_keys.production = Some(parse_key("MAGSTRIPE_FACTORY_KEY_PROD", &text)?);
        }
        if let Some(class) = lookup("MAGSTRIPE_READER_CLASS") {
            config.reader_class = class.parse()?;
        }

        Ok(config)
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_master_key(mut self, key: DesKey) -> Self {
        self.master_key = Some(key);
        self
    }

    pub fn with_factory_key(mut self, class: ReaderClass, key: DesKey) -> Self {
        match class {
            ReaderClass::Development => self.factory_keys.development = Some(key),
            ReaderClass::Production => self.factory_keys.production = Some(key),
        }
        self
    }

    pub fn with_reader_class(mut self, class: ReaderClass) -> Self {
        self.reader_class = class;
        self
    }

    pub fn with_backup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_path = path.into();
        self
    }

    /// Factory key for the configured reader class
    pub fn factory_key(&self) -> Result<&DesKey> {
        self.factory_keys
            .get(self.reader_class)
            .ok_or_else(|| Error::Config(format!("no {} factory key configured", self.reader_class)))
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            baud_rate: BaudRate::default().as_u32(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            master_key: None,
            factory_keys: FactoryKeys::default(),
            reader_class: ReaderClass::default(),
            backup_path: PathBuf::from(DEFAULT_BACKUP_FILE),
        }
    }
}

fn parse_key(name: &str, text: &str) -> Result<DesKey> {
    DesKey::from_hex(text).map_err(|e| Error::Config(format!("invalid {}: {}", name, e)))
}
