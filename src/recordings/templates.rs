//! Custom event templates and event specifier parsing
//!
//! Custom templates are TOML documents:
//!
//! ```toml
//! label = "Profiling-lite"
//! description = "Socket and GC events only"
//!
//! [events."jdk.SocketRead"]
//! enabled = true
//! threshold = "20 ms"
//! ```

use crate::agent::{EventConfiguration, EventTemplate, TemplateType};
use crate::error::{Error, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Parse `template=NAME[,type=TYPE]` into a template name and optional type
pub fn parse_event_specifier(specifier: &str) -> Result<(String, Option<TemplateType>)> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^template=(\w+)(?:,type=(\w+))?$").expect("static pattern"));

    let captures = pattern.captures(specifier).ok_or_else(|| {
        Error::InvalidOptions(format!("{} is an invalid events specifier", specifier))
    })?;
    let name = captures[1].to_string();
    let template_type = captures
        .get(2)
        .map(|m| m.as_str().parse::<TemplateType>())
        .transpose()?;
    Ok((name, template_type))
}

#[derive(Debug, Deserialize)]
struct TemplateDocument {
    label: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    events: BTreeMap<String, BTreeMap<String, toml::Value>>,
}

impl TemplateDocument {
    fn parse(content: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(content)
            .map_err(|e| Error::MalformedTemplate(format!("not UTF-8: {}", e)))?;
        let document: TemplateDocument =
            toml::from_str(text).map_err(|e| Error::MalformedTemplate(e.to_string()))?;

        static LABEL: OnceLock<Regex> = OnceLock::new();
        let label = LABEL.get_or_init(|| Regex::new(r"^\w[\w\-]*$").expect("static pattern"));
        if !label.is_match(&document.label) {
            return Err(Error::MalformedTemplate(format!(
                "invalid template label \"{}\"",
                document.label
            )));
        }
        document.event_configuration()?;
        Ok(document)
    }

    fn event_configuration(&self) -> Result<EventConfiguration> {
        let mut config = EventConfiguration::new();
        for (event_id, options) in &self.events {
            for (option, value) in options {
                let value = match value {
                    toml::Value::String(s) => s.clone(),
                    toml::Value::Integer(_) | toml::Value::Float(_) | toml::Value::Boolean(_) => {
                        value.to_string()
                    }
                    _ => {
                        return Err(Error::MalformedTemplate(format!(
                            "option {} of event {} must be a scalar",
                            option, event_id
                        )))
                    }
                };
                config.add_event(event_id, option, value);
            }
        }
        Ok(config)
    }

    fn template(&self) -> EventTemplate {
        EventTemplate {
            name: self.label.clone(),
            description: self.description.clone(),
            template_type: TemplateType::Custom,
        }
    }
}

/// Directory of operator-uploaded (CUSTOM) templates
#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Validate and persist a template, replacing one with the same label
    pub async fn add_template(&self, content: &[u8]) -> Result<EventTemplate> {
        let document = TemplateDocument::parse(content)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path_of(&document.label), content).await?;
        tracing::info!("Stored custom template {}", document.label);
        Ok(document.template())
    }

    pub async fn list(&self) -> Result<Vec<EventTemplate>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut templates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let content = tokio::fs::read(&path).await?;
            match TemplateDocument::parse(&content) {
                Ok(document) => templates.push(document.template()),
                Err(e) => tracing::warn!("Skipping template {}: {}", path.display(), e),
            }
        }
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    /// Event configuration of a custom template, `None` if not stored
    pub async fn get_events(&self, name: &str) -> Result<Option<EventConfiguration>> {
        let content = match tokio::fs::read(self.path_of(name)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let document = TemplateDocument::parse(&content)?;
        Ok(Some(document.event_configuration()?))
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_of(name)).await {
            Ok(()) => {
                tracing::info!("Deleted custom template {}", name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("Template", name))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn path_of(&self, name: &str) -> PathBuf {
        // Labels are validated to word characters and '-', so this stays
        // inside the store directory.
        let file = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.dir.join(format!("{}.toml", file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TEMPLATE: &str = r#"
label = "SocketsOnly"
description = "Socket events"

[events."jdk.SocketRead"]
enabled = true
threshold = "20 ms"
"#;

    #[test]
    fn test_parse_event_specifier() {
        assert_eq!(
            parse_event_specifier("template=Profiling").unwrap(),
            ("Profiling".to_string(), None)
        );
        assert_eq!(
            parse_event_specifier("template=Profiling,type=custom").unwrap(),
            ("Profiling".to_string(), Some(TemplateType::Custom))
        );
        assert!(parse_event_specifier("jdk.SocketRead:enabled=true").is_err());
        assert!(parse_event_specifier("template=Profiling,type=bogus").is_err());
    }

    #[tokio::test]
    async fn test_add_and_resolve_template() {
        let dir = tempdir().unwrap();
        let store = TemplateStore::new(dir.path());

        let template = store.add_template(TEMPLATE.as_bytes()).await.unwrap();
        assert_eq!(template.name, "SocketsOnly");
        assert_eq!(template.template_type, TemplateType::Custom);

        let events = store.get_events("SocketsOnly").await.unwrap().unwrap();
        assert!(events.is_enabled("jdk.SocketRead"));
        assert_eq!(events.option("jdk.SocketRead", "threshold"), Some("20 ms"));

        assert_eq!(store.list().await.unwrap(), vec![template]);
        assert!(store.get_events("Other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_templates_rejected() {
        let dir = tempdir().unwrap();
        let store = TemplateStore::new(dir.path());

        let not_toml = store.add_template(b"<configuration>").await;
        assert!(matches!(not_toml, Err(Error::MalformedTemplate(_))));

        let bad_label = store.add_template(b"label = \"../escape\"").await;
        assert!(matches!(bad_label, Err(Error::MalformedTemplate(_))));

        let nested = store
            .add_template(b"label = \"x\"\n[events.\"a\"]\nenabled = [1, 2]\n")
            .await;
        assert!(matches!(nested, Err(Error::MalformedTemplate(_))));
    }

    #[tokio::test]
    async fn test_delete_template() {
        let dir = tempdir().unwrap();
        let store = TemplateStore::new(dir.path());
        store.add_template(TEMPLATE.as_bytes()).await.unwrap();

        store.delete("SocketsOnly").await.unwrap();
        assert!(matches!(
            store.delete("SocketsOnly").await,
            Err(Error::NotFound { .. })
        ));
    }
}
