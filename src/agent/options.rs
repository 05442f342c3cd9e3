//! Recording options and the process-wide option overrides

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{OnceLock, RwLock};

fn recording_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[\w\-.]+$").expect("static pattern"))
}

/// Validated, immutable configuration of a recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOptions {
    pub name: String,

    /// Fixed duration in seconds; continuous when absent
    pub duration: Option<u64>,

    /// Maximum age of retained data in seconds
    pub max_age: Option<u64>,

    /// Maximum retained size in bytes
    pub max_size: Option<u64>,

    pub to_disk: Option<bool>,
}

impl RecordingOptions {
    pub fn builder(name: impl Into<String>) -> RecordingOptionsBuilder {
        RecordingOptionsBuilder::new(name)
    }
}

/// Builder for [`RecordingOptions`]
#[derive(Debug, Clone)]
pub struct RecordingOptionsBuilder {
    name: String,
    duration: Option<u64>,
    max_age: Option<u64>,
    max_size: Option<u64>,
    to_disk: Option<bool>,
}

impl RecordingOptionsBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            duration: None,
            max_age: None,
            max_size: None,
            to_disk: None,
        }
    }

    pub fn duration(mut self, seconds: u64) -> Self {
        self.duration = Some(seconds);
        self
    }

    pub fn max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn max_size(mut self, bytes: u64) -> Self {
        self.max_size = Some(bytes);
        self
    }

    pub fn to_disk(mut self, to_disk: bool) -> Self {
        self.to_disk = Some(to_disk);
        self
    }

    pub fn build(self) -> Result<RecordingOptions> {
        if !recording_name_pattern().is_match(&self.name) {
            return Err(Error::InvalidOptions(format!(
                "{} is an invalid recording name",
                self.name
            )));
        }
        if self.duration == Some(0) {
            return Err(Error::InvalidOptions(
                "recording duration must be positive".to_string(),
            ));
        }
        Ok(RecordingOptions {
            name: self.name,
            duration: self.duration,
            max_age: self.max_age,
            max_size: self.max_size,
            to_disk: self.to_disk,
        })
    }
}

/// Recording options that may be overridden process-wide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKey {
    ToDisk,
    MaxAge,
    MaxSize,
}

impl OptionKey {
    pub const ALL: [OptionKey; 3] = [OptionKey::ToDisk, OptionKey::MaxAge, OptionKey::MaxSize];

    pub fn as_str(&self) -> &'static str {
        match self {
            OptionKey::ToDisk => "toDisk",
            OptionKey::MaxAge => "maxAge",
            OptionKey::MaxSize => "maxSize",
        }
    }

    /// Name of the option descriptor the target advertises for this key
    pub fn descriptor_name(&self) -> &'static str {
        match self {
            OptionKey::ToDisk => "disk",
            OptionKey::MaxAge => "maxAge",
            OptionKey::MaxSize => "maxSize",
        }
    }

    fn validate(&self, value: &str) -> Result<()> {
        let ok = match self {
            OptionKey::ToDisk => value.parse::<bool>().is_ok(),
            OptionKey::MaxAge | OptionKey::MaxSize => value.parse::<u64>().is_ok(),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidOptions(format!(
                "{} is an invalid value for {}",
                value,
                self.as_str()
            )))
        }
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptionKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        OptionKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| {
                Error::InvalidOptions(format!("{} is an unrecognized or unsupported option", s))
            })
    }
}

/// Operator-set overrides applied to every recording started afterwards
#[derive(Debug, Default)]
pub struct RecordingOptionsCustomizer {
    overrides: RwLock<HashMap<OptionKey, String>>,
}

impl RecordingOptionsCustomizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: OptionKey, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        key.validate(&value)?;
        tracing::info!("Recording option {} set to {}", key, value);
        self.write().insert(key, value);
        Ok(())
    }

    pub fn unset(&self, key: OptionKey) {
        tracing::info!("Recording option {} unset", key);
        self.write().remove(&key);
    }

    pub fn get(&self, key: OptionKey) -> Option<String> {
        self.overrides
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
    }

    /// Fill unset builder fields from the overrides
    pub fn apply(&self, mut builder: RecordingOptionsBuilder) -> RecordingOptionsBuilder {
        if builder.to_disk.is_none() {
            builder.to_disk = self.get(OptionKey::ToDisk).and_then(|v| v.parse().ok());
        }
        if builder.max_age.is_none() {
            builder.max_age = self.get(OptionKey::MaxAge).and_then(|v| v.parse().ok());
        }
        if builder.max_size.is_none() {
            builder.max_size = self.get(OptionKey::MaxSize).and_then(|v| v.parse().ok());
        }
        builder
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<OptionKey, String>> {
        self.overrides.write().unwrap_or_else(|e| e.into_inner())
    }
}
