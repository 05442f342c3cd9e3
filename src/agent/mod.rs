//! Agent capability - the seam between the management plane and remote
//! observability agents
//!
//! The wire protocol spoken to an agent lives behind [`AgentConnector`] and
//! [`AgentSession`]. The rest of the crate only ever talks to a target
//! through these traits, and only while holding the target's lease in the
//! [`SessionManager`](crate::session::SessionManager).

pub mod memory;
mod options;
mod platform;

pub use options::{OptionKey, RecordingOptions, RecordingOptionsBuilder, RecordingOptionsCustomizer};
pub use platform::{platform_from_name, PLATFORM_STRATEGIES};

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Stable identifier of a monitored process (host:port, service URL, or a
/// discovery-assigned id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TargetId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Recording state as reported by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// A recording known to a target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingDescriptor {
    /// Agent-assigned numeric id
    pub id: i64,

    /// Recording name, unique per target (case-sensitive)
    pub name: String,

    pub state: RecordingState,

    pub options: RecordingOptions,

    pub start_time: DateTime<Utc>,
}

/// Where an event template comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TemplateType {
    /// Uploaded by an operator and stored locally
    Custom,
    /// Built into the target
    Target,
}

impl fmt::Display for TemplateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateType::Custom => f.write_str("CUSTOM"),
            TemplateType::Target => f.write_str("TARGET"),
        }
    }
}

impl FromStr for TemplateType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CUSTOM" => Ok(TemplateType::Custom),
            "TARGET" => Ok(TemplateType::Target),
            other => Err(crate::error::Error::InvalidOptions(format!(
                "unknown template type {}",
                other
            ))),
        }
    }
}

/// Metadata for a named event template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTemplate {
    pub name: String,
    pub description: String,
    pub template_type: TemplateType,
}

/// An event type a target can record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeInfo {
    /// Fully qualified event id, e.g. `jdk.SocketRead`
    pub id: String,

    /// Human-readable name
    pub name: String,
}

impl EventTypeInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Per-event option settings handed to the agent when a recording starts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventConfiguration {
    events: BTreeMap<String, BTreeMap<String, String>>,
}

impl EventConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a single option on an event
    pub fn add_event(
        &mut self,
        event_id: impl Into<String>,
        option: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.events
            .entry(event_id.into())
            .or_default()
            .insert(option.into(), value.into());
    }

    /// Enable every listed event type
    pub fn enable_all<'a>(event_types: impl IntoIterator<Item = &'a EventTypeInfo>) -> Self {
        let mut config = Self::new();
        for event_type in event_types {
            config.add_event(&event_type.id, "enabled", "true");
        }
        config
    }

    pub fn is_enabled(&self, event_id: &str) -> bool {
        self.option(event_id, "enabled") == Some("true")
    }

    pub fn option(&self, event_id: &str, option: &str) -> Option<&str> {
        self.events
            .get(event_id)
            .and_then(|opts| opts.get(option))
            .map(String::as_str)
    }

    pub fn event_ids(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl From<BTreeMap<String, BTreeMap<String, String>>> for EventConfiguration {
    fn from(events: BTreeMap<String, BTreeMap<String, String>>) -> Self {
        Self { events }
    }
}

/// A recording option the target advertises, with its default value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionDescriptor {
    pub name: String,
    pub description: String,
    /// Default as rendered by the agent, possibly unit-suffixed (`"0 s"`)
    pub default_value: String,
}

/// Byte stream of a recording's content
pub type RecordingStream = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// One live logical connection to a target
///
/// Implementations need not be safe for concurrent use by several tasks;
/// the session manager guarantees a single holder at a time.
#[async_trait]
pub trait AgentSession: Send + Sync {
    fn target(&self) -> &TargetId;

    /// Host string of the underlying connection
    fn host(&self) -> String;

    /// URI the target is reachable at, matched against discovery results
    fn service_uri(&self) -> String;

    /// False once the connection has dropped
    fn is_connected(&self) -> bool;

    async fn list_recordings(&self) -> Result<Vec<RecordingDescriptor>>;

    async fn available_event_types(&self) -> Result<Vec<EventTypeInfo>>;

    async fn available_recording_options(&self) -> Result<HashMap<String, OptionDescriptor>>;

    /// Templates built into the target
    async fn target_templates(&self) -> Result<Vec<EventTemplate>>;

    /// Event configuration of a built-in template, `None` when unknown
    async fn target_template_events(&self, name: &str) -> Result<Option<EventConfiguration>>;

    async fn start_recording(
        &self,
        options: &RecordingOptions,
        events: &EventConfiguration,
    ) -> Result<RecordingDescriptor>;

    /// Stop and discard a recording
    async fn close_recording(&self, descriptor: &RecordingDescriptor) -> Result<()>;

    async fn open_stream(&self, descriptor: &RecordingDescriptor) -> Result<RecordingStream>;

    /// Tear the connection down
    async fn disconnect(&self);
}

/// Opens agent sessions
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, target: &TargetId) -> Result<Arc<dyn AgentSession>>;
}

/// Scheme of the service URI an agent session reports
pub const AGENT_URI_SCHEME: &str = "agent://";

/// A discovered target with an optional human-readable alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub service_uri: String,
    pub alias: Option<String>,
}

impl ServiceRef {
    pub fn new(target: &TargetId, alias: Option<String>) -> Self {
        Self {
            service_uri: format!("{}{}", AGENT_URI_SCHEME, target),
            alias,
        }
    }

    /// Target the service URI points at
    pub fn target_id(&self) -> TargetId {
        let id = self
            .service_uri
            .strip_prefix(AGENT_URI_SCHEME)
            .unwrap_or(&self.service_uri);
        TargetId::from(id)
    }
}

/// Target discovery
#[async_trait]
pub trait TargetProvider: Send + Sync {
    async fn list_discoverable_services(&self) -> Result<Vec<ServiceRef>>;
}

/// Provider with nothing to discover
#[derive(Debug, Default, Clone)]
pub struct NoDiscovery;

#[async_trait]
impl TargetProvider for NoDiscovery {
    async fn list_discoverable_services(&self) -> Result<Vec<ServiceRef>> {
        Ok(Vec::new())
    }
}

/// Fixed list of discovered services
#[derive(Debug, Default, Clone)]
pub struct StaticDiscovery {
    services: Vec<ServiceRef>,
}

impl StaticDiscovery {
    pub fn new(services: Vec<ServiceRef>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl TargetProvider for StaticDiscovery {
    async fn list_discoverable_services(&self) -> Result<Vec<ServiceRef>> {
        Ok(self.services.clone())
    }
}
