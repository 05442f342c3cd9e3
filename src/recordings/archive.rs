//! Archive of saved recordings on persistent storage

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs::{File, OpenOptions};

/// Candidate names tried for one destination, the bare name included
pub const MAX_RENAME_ATTEMPTS: u32 = 127;

/// Extension given to archived recordings
pub const RECORDING_EXTENSION: &str = ".jfr";

/// Replace runs of `.` and `_` in a target alias with `-`
pub fn normalize_alias(alias: &str) -> String {
    static SEPARATORS: OnceLock<Regex> = OnceLock::new();
    SEPARATORS
        .get_or_init(|| Regex::new(r"[._]+").expect("static pattern"))
        .replace_all(alias, "-")
        .into_owned()
}

/// Current time truncated to seconds with separators stripped,
/// e.g. `20240101T000000`
pub fn format_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%S").to_string()
}

/// `{alias}_{recording}_{timestamp}` without extension
pub fn base_name(alias: &str, recording_name: &str, timestamp: &str) -> String {
    let recording_name = recording_name
        .strip_suffix(RECORDING_EXTENSION)
        .unwrap_or(recording_name);
    format!("{}_{}_{}", alias, recording_name, timestamp)
}

/// Directory of archived recordings
#[derive(Debug, Clone)]
pub struct Archive {
    dir: PathBuf,
}

impl Archive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserve a free file name derived from `base` and open it for
    /// writing. Collisions append `.1`, `.2`, ... before the extension.
    pub async fn create_destination(&self, base: &str) -> Result<(String, File)> {
        tokio::fs::create_dir_all(&self.dir).await?;
        for attempt in 0..MAX_RENAME_ATTEMPTS {
            let candidate = if attempt == 0 {
                format!("{}{}", base, RECORDING_EXTENSION)
            } else {
                format!("{}.{}{}", base, attempt, RECORDING_EXTENSION)
            };
            let opened = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.dir.join(&candidate))
                .await;
            match opened {
                Ok(file) => return Ok((candidate, file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::DestinationExhausted {
            destination: base.to_string(),
        })
    }

    /// Archived file names, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Path of an archived recording, if it is in the archive
    pub async fn locate(&self, name: &str) -> Result<Option<PathBuf>> {
        if !self.list().await?.iter().any(|saved| saved == name) {
            return Ok(None);
        }
        Ok(Some(self.dir.join(name)))
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self
            .locate(name)
            .await?
            .ok_or_else(|| Error::not_found("Recording", name))?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("Recording", name))
            }
            Err(e) => Err(e.into()),
        }
    }
}
