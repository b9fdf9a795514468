//! Configuration for storage backends.
//!
//! Backends are configured from section-style key/value pairs (the shape a
//! server config file hands us). [`ConfigSection`] is the raw section;
//! [`StorageOptions`] is the typed view a backend validates before
//! connecting.

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// A section of key/value configuration entries.
///
/// Keys are matched case-insensitively. Values are plain strings; typed
/// accessors parse on demand.
///
/// # Example
///
/// ```rust
/// use varstore::ConfigSection;
///
/// let section = ConfigSection::new()
///     .with("file", "./variables.db")
///     .with("commit changes", "2 seconds");
/// assert_eq!(section.get("file"), Some("./variables.db"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigSection {
    entries: BTreeMap<String, String>,
}

impl ConfigSection {
    /// Creates an empty section.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, returning the section for chaining.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Sets an entry in place.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_lowercase(), value.into());
    }

    /// Returns the raw value for a key, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_lowercase()).map(|s| s.as_str())
    }

    /// Returns the value for a key, or a configuration error naming it.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| Error::config(format!("missing required option '{}'", key)))
    }

    /// Parses a numeric value.
    pub fn get_u16(&self, key: &str) -> Result<Option<u16>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map(Some)
                .map_err(|_| Error::config(format!("option '{}' is not a number: '{}'", key, raw))),
        }
    }

    /// Parses a duration value such as `"10 seconds"`, `"500 milliseconds"`
    /// or `"2 minutes"`. Absence is not an error; it simply disables
    /// whatever the duration would have enabled.
    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => parse_duration(raw)
                .map(Some)
                .map_err(|msg| Error::config(format!("option '{}': {}", key, msg))),
        }
    }
}

fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| format!("'{}' has no unit", raw))?;
    let (num, unit) = raw.split_at(split);
    let amount: f64 = num.trim().parse().map_err(|_| format!("'{}' is not a number", num))?;
    if amount < 0.0 {
        return Err(format!("'{}' is negative", raw));
    }
    let millis = match unit.trim().to_lowercase().as_str() {
        "ms" | "millisecond" | "milliseconds" => amount,
        "s" | "sec" | "second" | "seconds" => amount * 1000.0,
        "m" | "min" | "minute" | "minutes" => amount * 60.0 * 1000.0,
        "h" | "hour" | "hours" => amount * 60.0 * 60.0 * 1000.0,
        other => return Err(format!("unknown time unit '{}'", other)),
    };
    Ok(Duration::from_millis(millis as u64))
}

/// Default table name for SQL backends.
pub const DEFAULT_TABLE: &str = "variables";

/// Typed connection options shared by the SQL backends.
///
/// File-based backends use `file`; networked backends use
/// `host`/`port`/`user`/`password`/`database`. `monitor_interval` enables
/// cross-process change polling where the backend supports it;
/// `commit_interval` switches the connection from autocommit to periodic
/// batched commits.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Database file path, for embedded backends.
    pub file: Option<PathBuf>,

    /// Server host name, for networked backends.
    pub host: Option<String>,

    /// Server port. Defaults to 3306.
    pub port: u16,

    /// User name for authentication.
    pub user: Option<String>,

    /// Password for authentication.
    pub password: Option<String>,

    /// Database (schema) name.
    pub database: Option<String>,

    /// Table holding the variables. Defaults to [`DEFAULT_TABLE`].
    pub table: String,

    /// Poll interval for changes written by other processes. `None`
    /// disables cross-process polling.
    pub monitor_interval: Option<Duration>,

    /// Delay between batched commits. `None` means autocommit.
    pub commit_interval: Option<Duration>,
}

impl StorageOptions {
    /// Parses options from a configuration section. Key names follow the
    /// server config surface: `file`, `host`, `port`, `user`, `password`,
    /// `database`, `table`, `monitor interval`, `commit changes`.
    pub fn from_section(section: &ConfigSection) -> Result<Self> {
        Ok(Self {
            file: section.get("file").map(PathBuf::from),
            host: section.get("host").map(String::from),
            port: section.get_u16("port")?.unwrap_or(3306),
            user: section.get("user").map(String::from),
            password: section.get("password").map(String::from),
            database: section.get("database").map(String::from),
            table: section.get("table").unwrap_or(DEFAULT_TABLE).to_string(),
            monitor_interval: section.get_duration("monitor interval")?,
            commit_interval: section.get_duration("commit changes")?,
        })
    }

    /// Validates the options for a file-backed (embedded) backend.
    pub fn validate_file(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(Error::config("embedded backend requires a 'file' option"));
        }
        Ok(())
    }

    /// Validates the options for a networked backend.
    pub fn validate_network(&self) -> Result<()> {
        if self.host.is_none() {
            return Err(Error::config("networked backend requires a 'host' option"));
        }
        if self.database.is_none() {
            return Err(Error::config("networked backend requires a 'database' option"));
        }
        if self.user.is_none() {
            return Err(Error::config("networked backend requires a 'user' option"));
        }
        Ok(())
    }
}
