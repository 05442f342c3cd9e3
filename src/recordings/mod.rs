//! Recording lifecycle - start, save and delete recordings on targets
//!
//! Every operation runs as a single task through the [`SessionManager`], so
//! the existence check and the mutation that follows it see the same
//! session state.

mod archive;
mod templates;

pub use archive::{
    base_name, format_timestamp, normalize_alias, Archive, MAX_RENAME_ATTEMPTS,
    RECORDING_EXTENSION,
};
pub use templates::{parse_event_specifier, TemplateStore};

use crate::agent::{
    AgentSession, EventConfiguration, EventTemplate, NoDiscovery, OptionKey, RecordingDescriptor,
    RecordingOptions, RecordingOptionsBuilder, RecordingOptionsCustomizer, TargetId,
    TargetProvider, TemplateType,
};
use crate::error::{Error, Result};
use crate::protocol::{Notification, NotificationSender};
use crate::reports::ReportCache;
use crate::session::SessionManager;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncWriteExt;

/// Synthetic template name enabling every available event type
pub const ALL_EVENTS_TEMPLATE: &str = "ALL";

/// Source of the current time for archive names
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a given instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Recording options in effect for a target: the operator override if one
/// is set, else the target's advertised default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveOptions {
    pub to_disk: Option<String>,
    pub max_age: Option<String>,
    pub max_size: Option<String>,
}

fn first_number(value: &str) -> Option<String> {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    NUMBER
        .get_or_init(|| Regex::new(r"\d+").expect("static pattern"))
        .find(value)
        .map(|m| m.as_str().to_string())
}

async fn find_recording(
    session: &dyn AgentSession,
    name: &str,
) -> Result<Option<RecordingDescriptor>> {
    Ok(session
        .list_recordings()
        .await?
        .into_iter()
        .find(|r| r.name == name))
}

/// Orchestrates recording lifecycles across targets
pub struct RecordingOrchestrator {
    sessions: Arc<SessionManager>,
    templates: Arc<TemplateStore>,
    archive: Arc<Archive>,
    reports: Arc<dyn ReportCache>,
    notifications: NotificationSender,
    targets: Arc<dyn TargetProvider>,
    customizer: Arc<RecordingOptionsCustomizer>,
    clock: Arc<dyn Clock>,
}

impl RecordingOrchestrator {
    /// Orchestrator without target discovery, using the system clock
    pub fn new(
        sessions: Arc<SessionManager>,
        templates: Arc<TemplateStore>,
        archive: Arc<Archive>,
        reports: Arc<dyn ReportCache>,
        notifications: NotificationSender,
    ) -> Self {
        Self {
            sessions,
            templates,
            archive,
            reports,
            notifications,
            targets: Arc::new(NoDiscovery),
            customizer: Arc::new(RecordingOptionsCustomizer::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Discovery used to resolve archive aliases
    pub fn with_target_provider(mut self, targets: Arc<dyn TargetProvider>) -> Self {
        self.targets = targets;
        self
    }

    /// Share option overrides with other components
    pub fn with_customizer(mut self, customizer: Arc<RecordingOptionsCustomizer>) -> Self {
        self.customizer = customizer;
        self
    }

    /// Clock used for archive timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Session manager every target operation runs through
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Process-wide recording option overrides
    pub fn customizer(&self) -> &Arc<RecordingOptionsCustomizer> {
        &self.customizer
    }

    /// Archive that saved recordings are written to
    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    /// Validate options, filling unset fields from the operator overrides
    pub fn build_options(&self, builder: RecordingOptionsBuilder) -> Result<RecordingOptions> {
        self.customizer.apply(builder).build()
    }

    /// Start a recording and announce it with a `RecordingCreated`
    /// notification.
    ///
    /// Fails with [`Error::NameCollision`] before touching anything else if
    /// the target already has a recording with this name.
    pub async fn start(
        &self,
        target: &TargetId,
        options: RecordingOptions,
        template_name: &str,
        template_type: Option<TemplateType>,
    ) -> Result<RecordingDescriptor> {
        self.sessions
            .run(target, |session| async move {
                if find_recording(&*session, &options.name).await?.is_some() {
                    return Err(Error::NameCollision { name: options.name });
                }
                let events = self
                    .resolve_events(&*session, template_name, template_type)
                    .await?;
                let descriptor = session.start_recording(&options, &events).await?;
                tracing::info!(
                    "Started recording {} on {} with template {}",
                    descriptor.name,
                    target,
                    template_name
                );
                self.notifications
                    .send(Notification::recording_created(&descriptor.name, target));
                Ok(descriptor)
            })
            .await
    }

    /// Copy a recording into the archive. Returns the archived file name.
    pub async fn save(&self, target: &TargetId, recording_name: &str) -> Result<String> {
        self.sessions
            .run(target, |session| async move {
                let descriptor = find_recording(&*session, recording_name)
                    .await?
                    .ok_or_else(|| Error::not_found("Recording", recording_name))?;

                let alias = self.target_alias(&*session).await;
                let timestamp = format_timestamp(self.clock.now());
                let base = base_name(&alias, &descriptor.name, &timestamp);
                let (file_name, mut file) = self.archive.create_destination(&base).await?;

                let copied = async {
                    let mut stream = session.open_stream(&descriptor).await?;
                    tokio::io::copy(&mut stream, &mut file).await?;
                    file.flush().await?;
                    Ok::<_, Error>(())
                }
                .await;
                if let Err(e) = copied {
                    drop(file);
                    let partial = self.archive.dir().join(&file_name);
                    if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                        tracing::warn!("Failed to remove partial archive {}: {}", file_name, cleanup);
                    }
                    return Err(e);
                }

                tracing::info!("Saved recording {} from {} as {}", recording_name, target, file_name);
                Ok(file_name)
            })
            .await
    }

    /// Close a recording on the target and evict its cached report. The
    /// report is evicted even when closing fails.
    pub async fn delete(&self, target: &TargetId, recording_name: &str) -> Result<()> {
        self.sessions
            .run(target, |session| async move {
                let descriptor = find_recording(&*session, recording_name)
                    .await?
                    .ok_or_else(|| Error::not_found("Recording", recording_name))?;
                let closed = session.close_recording(&descriptor).await;
                self.reports.delete_active(target, recording_name);
                match &closed {
                    Ok(()) => tracing::info!("Deleted recording {} on {}", recording_name, target),
                    Err(e) => tracing::warn!(
                        "Failed to close recording {} on {}: {}",
                        recording_name,
                        target,
                        e
                    ),
                }
                closed
            })
            .await
    }

    /// Recordings present on the target
    pub async fn list(&self, target: &TargetId) -> Result<Vec<RecordingDescriptor>> {
        self.sessions
            .run(target, |session| async move { session.list_recordings().await })
            .await
    }

    /// Custom templates, the target's built-in templates and the synthetic
    /// `ALL` template
    pub async fn list_templates(&self, target: &TargetId) -> Result<Vec<EventTemplate>> {
        let mut templates = self.templates.list().await?;
        let builtin = self
            .sessions
            .run(target, |session| async move { session.target_templates().await })
            .await?;
        templates.extend(builtin);
        templates.push(EventTemplate {
            name: ALL_EVENTS_TEMPLATE.to_string(),
            description: "Enable all available events".to_string(),
            template_type: TemplateType::Target,
        });
        Ok(templates)
    }

    /// Effective `toDisk`, `maxAge` and `maxSize` for the target. Numeric
    /// values are reduced to their leading integer.
    pub async fn effective_options(&self, target: &TargetId) -> Result<EffectiveOptions> {
        let advertised = self
            .sessions
            .run(target, |session| async move {
                session.available_recording_options().await
            })
            .await?;
        let value_of = |key: OptionKey| {
            self.customizer.get(key).or_else(|| {
                advertised
                    .get(key.descriptor_name())
                    .map(|d| d.default_value.clone())
            })
        };
        Ok(EffectiveOptions {
            to_disk: value_of(OptionKey::ToDisk),
            max_age: value_of(OptionKey::MaxAge).and_then(|v| first_number(&v)),
            max_size: value_of(OptionKey::MaxSize).and_then(|v| first_number(&v)),
        })
    }

    /// Archived recording file names, sorted
    pub async fn list_archived(&self) -> Result<Vec<String>> {
        self.archive.list().await
    }

    /// Remove an archived recording. Its stored report is evicted whatever
    /// the outcome.
    pub async fn delete_archived(&self, name: &str) -> Result<()> {
        let deleted = self.archive.delete(name).await;
        self.reports.delete_archived(name).await;
        match &deleted {
            Ok(()) => tracing::info!("Deleted archived recording {}", name),
            Err(e) => tracing::warn!("Failed to delete archived recording {}: {}", name, e),
        }
        deleted
    }

    async fn resolve_events(
        &self,
        session: &dyn AgentSession,
        template_name: &str,
        template_type: Option<TemplateType>,
    ) -> Result<EventConfiguration> {
        if template_name == ALL_EVENTS_TEMPLATE {
            let event_types = session.available_event_types().await?;
            return Ok(EventConfiguration::enable_all(&event_types));
        }

        let events = match template_type {
            Some(TemplateType::Custom) => self.templates.get_events(template_name).await?,
            Some(TemplateType::Target) => session.target_template_events(template_name).await?,
            None => match self.templates.get_events(template_name).await? {
                Some(events) => Some(events),
                None => match session.target_template_events(template_name).await {
                    Ok(events) => events,
                    Err(e) if e.is_session_fatal() => return Err(e),
                    Err(e) => {
                        tracing::debug!("Target template lookup for {} failed: {}", template_name, e);
                        None
                    }
                },
            },
        };
        events.ok_or_else(|| Error::UnknownTemplate {
            name: template_name.to_string(),
            template_type: template_type
                .map(|t| t.to_string())
                .unwrap_or_else(|| "CUSTOM or TARGET".to_string()),
        })
    }

    async fn target_alias(&self, session: &dyn AgentSession) -> String {
        let service_uri = session.service_uri();
        let alias = match self.targets.list_discoverable_services().await {
            Ok(services) => services
                .into_iter()
                .filter(|s| s.service_uri == service_uri)
                .find_map(|s| s.alias),
            Err(e) => {
                tracing::warn!("Target discovery failed, using host as alias: {}", e);
                None
            }
        };
        normalize_alias(&alias.unwrap_or_else(|| session.host()))
    }
}
