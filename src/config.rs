//! Persisted configuration.
//!
//! The file is TOML with one table per section:
//!
//! ```toml
//! [DEFAULT]
//! setpoint = 65.0
//! window = 0.2
//! tiltcolor = "ORANGE"
//!
//! [system]
//! aio_user = "update_this"
//! aio_key = "update_this"
//! group = "garage"
//! interval = 60
//!
//! [port1]
//! setpoint = 64.0
//!
//! [port2]
//! ```
//!
//! Channel sections inherit missing keys from `DEFAULT`. A missing or broken
//! file is never fatal. A missing file is written out with defaults on the
//! next flush. A file that does not parse is left alone until a setting is
//! edited, and is then moved to `<name>.bak` before the new one is written.
//! Keys with invalid values fall back to their defaults one by one.

use crate::beacon::BeaconColor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Placeholder credentials written to a fresh config file.
pub const UNSET_CREDENTIALS: &str = "update_this";

pub const DEFAULT_GROUP: &str = "garage";

/// Minimum seconds between uploads to one series.
pub const DEFAULT_REPORT_INTERVAL_S: u64 = 60;

/// Sections holding per-channel settings.
pub const CHANNEL_SECTIONS: [&str; 2] = ["port1", "port2"];

const DEFAULT_SECTION: &str = "DEFAULT";
const SYSTEM_SECTION: &str = "system";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Settings of one thermostat channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub setpoint: f64,
    /// Hysteresis half-width around the setpoint
    pub window: f64,
    /// Paired hydrometer, `NONE` in the file when unpaired
    #[serde(rename = "tiltcolor", with = "beacon_name")]
    pub beacon: Option<BeaconColor>,
    /// Changed since it was last written out
    #[serde(skip)]
    pub dirty: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            setpoint: 65.0,
            window: 0.2,
            beacon: Some(BeaconColor::Orange),
            dirty: false,
        }
    }
}

/// Telemetry credentials and reporting cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub aio_user: String,
    pub aio_key: String,
    pub group: String,
    /// Seconds
    pub interval: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            aio_user: UNSET_CREDENTIALS.to_string(),
            aio_key: UNSET_CREDENTIALS.to_string(),
            group: DEFAULT_GROUP.to_string(),
            interval: DEFAULT_REPORT_INTERVAL_S,
        }
    }
}

impl SystemConfig {
    pub fn has_credentials(&self) -> bool {
        self.aio_user != UNSET_CREDENTIALS && self.aio_key != UNSET_CREDENTIALS
    }
}

/// Everything in the config file, plus where it lives.
#[derive(Debug, Clone)]
pub struct Settings {
    path: PathBuf,
    pub defaults: ChannelConfig,
    pub system: SystemConfig,
    channels: BTreeMap<String, ChannelConfig>,
    dirty: bool,
    /// The file on disk did not parse and has not been backed up yet
    unreadable: bool,
}

/// `~/.beercntlr.toml`
pub fn default_config_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".beercntlr.toml")
}

impl Settings {
    /// Load settings, falling back to defaults for anything missing.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match fs::read_to_string(&path) {
            Ok(text) => match Self::parse(&path, &text) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("{}: {e}; using defaults", path.display());
                    Self {
                        dirty: false,
                        unreadable: true,
                        ..Self::with_defaults(path)
                    }
                }
            },
            Err(e) => {
                info!("{}: {e}; using defaults", path.display());
                Self::with_defaults(path)
            }
        }
    }

    fn with_defaults(path: PathBuf) -> Self {
        Self {
            path,
            defaults: ChannelConfig::default(),
            system: SystemConfig::default(),
            channels: CHANNEL_SECTIONS
                .iter()
                .map(|name| (name.to_string(), ChannelConfig::default()))
                .collect(),
            dirty: true,
            unreadable: false,
        }
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        let mut file: toml::Table = toml::from_str(text)?;
        let mut dirty = false;

        let default_table = section::<ChannelConfig>(&mut file, DEFAULT_SECTION, &mut dirty);
        let defaults: ChannelConfig = toml::Value::Table(default_table.clone())
            .try_into()
            .unwrap_or_default();

        let system: SystemConfig = toml::Value::Table(section::<SystemConfig>(
            &mut file,
            SYSTEM_SECTION,
            &mut dirty,
        ))
        .try_into()
        .unwrap_or_default();

        let mut channels = BTreeMap::new();
        for name in CHANNEL_SECTIONS {
            let mut merged = default_table.clone();
            merged.extend(section::<ChannelConfig>(&mut file, name, &mut dirty));
            let config: ChannelConfig = match toml::Value::Table(merged).try_into() {
                Ok(config) => config,
                Err(e) => {
                    warn!("section [{name}]: {e}; using defaults");
                    dirty = true;
                    defaults.clone()
                }
            };
            channels.insert(name.to_string(), config);
        }

        Ok(Self {
            path: path.to_path_buf(),
            defaults,
            system,
            channels,
            dirty,
            unreadable: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Settings for a channel section, `DEFAULT` values if the section is unknown.
    pub fn channel(&self, section: &str) -> ChannelConfig {
        self.channels
            .get(section)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Record a channel's published settings; marks the file dirty on change.
    pub fn update_channel(&mut self, section: &str, mut config: ChannelConfig) {
        config.dirty = false;
        if self.channels.get(section) != Some(&config) {
            self.channels.insert(section.to_string(), config);
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let mut file = toml::Table::new();
        file.insert(DEFAULT_SECTION.to_string(), toml::Value::try_from(&self.defaults)?);
        file.insert(SYSTEM_SECTION.to_string(), toml::Value::try_from(&self.system)?);
        for (name, config) in &self.channels {
            file.insert(name.clone(), toml::Value::try_from(config)?);
        }
        Ok(toml::to_string(&file)?)
    }

    /// Rewrite the whole file and clear the dirty flag.
    pub fn save(&mut self) -> Result<(), ConfigError> {
        let text = self.to_toml()?;
        if self.unreadable {
            let backup = backup_path(&self.path);
            fs::rename(&self.path, &backup)?;
            warn!("moved unreadable {} to {}", self.path.display(), backup.display());
            self.unreadable = false;
        }
        fs::write(&self.path, text)?;
        debug!("wrote {}", self.path.display());
        self.dirty = false;
        Ok(())
    }
}

/// `<path>.bak`
fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// Take `name` out of the file, keeping only the keys that deserialize into
/// `T` on their own. Anything missing or dropped marks the settings dirty.
fn section<T: DeserializeOwned>(
    file: &mut toml::Table,
    name: &str,
    dirty: &mut bool,
) -> toml::Table {
    let table = match file.remove(name) {
        Some(toml::Value::Table(table)) => table,
        Some(_) => {
            warn!("[{name}] is not a table; using defaults");
            *dirty = true;
            return toml::Table::new();
        }
        None => {
            *dirty = true;
            return toml::Table::new();
        }
    };
    table
        .into_iter()
        .filter(|(key, value)| {
            let single = toml::Table::from_iter([(key.clone(), value.clone())]);
            let parsed: Result<T, _> = toml::Value::Table(single).try_into();
            match parsed {
                Ok(_) => true,
                Err(e) => {
                    warn!("[{name}] {key}: {e}; using default");
                    *dirty = true;
                    false
                }
            }
        })
        .collect()
}

/// `Option<BeaconColor>` as its colour name, `"NONE"` when unpaired.
mod beacon_name {
    use crate::beacon::BeaconColor;
    use serde::{Deserialize, Deserializer, Serializer};

    const UNPAIRED: &str = "NONE";

    pub fn serialize<S: Serializer>(
        value: &Option<BeaconColor>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.map_or(UNPAIRED, BeaconColor::name))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<BeaconColor>, D::Error> {
        let name = String::deserialize(deserializer)?;
        if name.eq_ignore_ascii_case(UNPAIRED) {
            return Ok(None);
        }
        name.parse().map(Some).map_err(serde::de::Error::custom)
    }
}
