//! In-process agent used by the demo server and the test suites

use super::{
    AgentConnector, AgentSession, EventConfiguration, EventTemplate, EventTypeInfo,
    OptionDescriptor, RecordingDescriptor, RecordingOptions, RecordingState, RecordingStream,
    TargetId, TemplateType, AGENT_URI_SCHEME,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

struct StoredRecording {
    descriptor: RecordingDescriptor,
    content: Vec<u8>,
}

struct TargetState {
    recordings: Vec<StoredRecording>,
    next_id: i64,
    event_types: Vec<EventTypeInfo>,
    templates: HashMap<String, (EventTemplate, EventConfiguration)>,
    options: HashMap<String, OptionDescriptor>,
    /// Bumped whenever the target drops its connections
    generation: u64,
    start_calls: usize,
    /// Fail the next close with a lost connection
    fail_close: bool,
}

impl TargetState {
    fn new() -> Self {
        let event_types = vec![
            EventTypeInfo::new("jdk.CPULoad", "CPU Load"),
            EventTypeInfo::new("jdk.GarbageCollection", "Garbage Collection"),
            EventTypeInfo::new("jdk.SocketRead", "Socket Read"),
            EventTypeInfo::new("jdk.ThreadPark", "Java Thread Park"),
        ];

        let mut templates = HashMap::new();
        let mut continuous = EventConfiguration::new();
        continuous.add_event("jdk.CPULoad", "enabled", "true");
        continuous.add_event("jdk.CPULoad", "period", "1000 ms");
        continuous.add_event("jdk.GarbageCollection", "enabled", "true");
        templates.insert(
            "Continuous".to_string(),
            (
                EventTemplate {
                    name: "Continuous".to_string(),
                    description: "Low overhead configuration safe for continuous use".to_string(),
                    template_type: TemplateType::Target,
                },
                continuous,
            ),
        );
        let mut profiling = EventConfiguration::enable_all(&event_types);
        profiling.add_event("jdk.SocketRead", "threshold", "10 ms");
        templates.insert(
            "Profiling".to_string(),
            (
                EventTemplate {
                    name: "Profiling".to_string(),
                    description: "Low overhead configuration for profiling".to_string(),
                    template_type: TemplateType::Target,
                },
                profiling,
            ),
        );

        let options = [("disk", "false"), ("maxAge", "0 s"), ("maxSize", "0 B")]
            .into_iter()
            .map(|(name, default_value)| {
                (
                    name.to_string(),
                    OptionDescriptor {
                        name: name.to_string(),
                        description: String::new(),
                        default_value: default_value.to_string(),
                    },
                )
            })
            .collect();

        Self {
            recordings: Vec::new(),
            next_id: 1,
            event_types,
            templates,
            options,
            generation: 0,
            start_calls: 0,
            fail_close: false,
        }
    }
}

fn lock(state: &Mutex<TargetState>) -> MutexGuard<'_, TargetState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle for inspecting and mutating a simulated target
#[derive(Clone)]
pub struct MemoryTarget {
    id: TargetId,
    state: Arc<Mutex<TargetState>>,
}

impl MemoryTarget {
    pub fn id(&self) -> &TargetId {
        &self.id
    }

    pub fn set_event_types(&self, event_types: Vec<EventTypeInfo>) {
        lock(&self.state).event_types = event_types;
    }

    pub fn add_template(&self, name: &str, events: EventConfiguration) {
        let template = EventTemplate {
            name: name.to_string(),
            description: String::new(),
            template_type: TemplateType::Target,
        };
        lock(&self.state)
            .templates
            .insert(name.to_string(), (template, events));
    }

    pub fn set_option_default(&self, name: &str, default_value: &str) {
        lock(&self.state).options.insert(
            name.to_string(),
            OptionDescriptor {
                name: name.to_string(),
                description: String::new(),
                default_value: default_value.to_string(),
            },
        );
    }

    /// Insert a running recording with the given content
    pub fn add_recording(&self, name: &str, content: &[u8]) {
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        state.recordings.push(StoredRecording {
            descriptor: RecordingDescriptor {
                id,
                name: name.to_string(),
                state: RecordingState::Running,
                options: RecordingOptions {
                    name: name.to_string(),
                    duration: None,
                    max_age: None,
                    max_size: None,
                    to_disk: None,
                },
                start_time: Utc::now(),
            },
            content: content.to_vec(),
        });
    }

    pub fn recording_names(&self) -> Vec<String> {
        lock(&self.state)
            .recordings
            .iter()
            .map(|r| r.descriptor.name.clone())
            .collect()
    }

    /// Options the recording named `name` was started with
    pub fn recording_options(&self, name: &str) -> Option<RecordingOptions> {
        lock(&self.state)
            .recordings
            .iter()
            .find(|r| r.descriptor.name == name)
            .map(|r| r.descriptor.options.clone())
    }

    /// Number of times a recording start reached the agent
    pub fn start_calls(&self) -> usize {
        lock(&self.state).start_calls
    }

    /// Make the next recording close fail as if the connection dropped
    /// mid-call. The recording stays on the target.
    pub fn fail_next_close(&self) {
        lock(&self.state).fail_close = true;
    }

    /// Drop every open connection to this target
    pub fn sever(&self) {
        lock(&self.state).generation += 1;
    }
}

/// Connector over a set of simulated targets
#[derive(Default)]
pub struct MemoryConnector {
    targets: Mutex<HashMap<TargetId, MemoryTarget>>,
    last_events: Arc<Mutex<HashMap<TargetId, EventConfiguration>>>,
    connects: AtomicUsize,
    disconnects: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_target(&self, id: impl Into<TargetId>) -> MemoryTarget {
        let id = id.into();
        let target = MemoryTarget {
            id: id.clone(),
            state: Arc::new(Mutex::new(TargetState::new())),
        };
        self.targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, target.clone());
        target
    }

    pub fn target(&self, id: &TargetId) -> Option<MemoryTarget> {
        self.targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Sessions opened so far
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Sessions explicitly closed so far
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Event configuration of the latest recording started on a target
    pub fn last_started_events(&self, id: &TargetId) -> Option<EventConfiguration> {
        self.last_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

#[async_trait]
impl AgentConnector for MemoryConnector {
    async fn connect(&self, target: &TargetId) -> Result<Arc<dyn AgentSession>> {
        let memory_target = self.target(target).ok_or_else(|| Error::ConnectionUnavailable {
            target: target.to_string(),
            reason: "connection refused".to_string(),
        })?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        let generation = lock(&memory_target.state).generation;
        Ok(Arc::new(MemorySession {
            target: memory_target,
            generation,
            closed: AtomicBool::new(false),
            last_events: Arc::clone(&self.last_events),
            disconnects: Arc::clone(&self.disconnects),
        }))
    }
}

struct MemorySession {
    target: MemoryTarget,
    generation: u64,
    closed: AtomicBool,
    last_events: Arc<Mutex<HashMap<TargetId, EventConfiguration>>>,
    disconnects: Arc<AtomicUsize>,
}

impl MemorySession {
    fn state(&self) -> Result<MutexGuard<'_, TargetState>> {
        let state = lock(&self.target.state);
        if self.closed.load(Ordering::SeqCst) || state.generation != self.generation {
            return Err(Error::SessionLost {
                target: self.target.id.to_string(),
                reason: "connection reset".to_string(),
            });
        }
        Ok(state)
    }
}

#[async_trait]
impl AgentSession for MemorySession {
    fn target(&self) -> &TargetId {
        &self.target.id
    }

    fn host(&self) -> String {
        let id = self.target.id.as_str();
        id.rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| id.to_string())
    }

    fn service_uri(&self) -> String {
        format!("{}{}", AGENT_URI_SCHEME, self.target.id)
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && lock(&self.target.state).generation == self.generation
    }

    async fn list_recordings(&self) -> Result<Vec<RecordingDescriptor>> {
        Ok(self
            .state()?
            .recordings
            .iter()
            .map(|r| r.descriptor.clone())
            .collect())
    }

    async fn available_event_types(&self) -> Result<Vec<EventTypeInfo>> {
        Ok(self.state()?.event_types.clone())
    }

    async fn available_recording_options(&self) -> Result<HashMap<String, OptionDescriptor>> {
        Ok(self.state()?.options.clone())
    }

    async fn target_templates(&self) -> Result<Vec<EventTemplate>> {
        let mut templates: Vec<_> = self
            .state()?
            .templates
            .values()
            .map(|(template, _)| template.clone())
            .collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    async fn target_template_events(&self, name: &str) -> Result<Option<EventConfiguration>> {
        Ok(self
            .state()?
            .templates
            .get(name)
            .map(|(_, events)| events.clone()))
    }

    async fn start_recording(
        &self,
        options: &RecordingOptions,
        events: &EventConfiguration,
    ) -> Result<RecordingDescriptor> {
        let descriptor = {
            let mut state = self.state()?;
            state.start_calls += 1;
            if state
                .recordings
                .iter()
                .any(|r| r.descriptor.name == options.name)
            {
                return Err(Error::internal(format!(
                    "agent refused duplicate recording {}",
                    options.name
                )));
            }
            let id = state.next_id;
            state.next_id += 1;
            let descriptor = RecordingDescriptor {
                id,
                name: options.name.clone(),
                state: RecordingState::Running,
                options: options.clone(),
                start_time: Utc::now(),
            };
            let content = format!("FLR\0{}\0{}", options.name, events.len()).into_bytes();
            state.recordings.push(StoredRecording {
                descriptor: descriptor.clone(),
                content,
            });
            descriptor
        };
        self.last_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.target.id.clone(), events.clone());
        Ok(descriptor)
    }

    async fn close_recording(&self, descriptor: &RecordingDescriptor) -> Result<()> {
        let mut state = self.state()?;
        if std::mem::take(&mut state.fail_close) {
            return Err(Error::SessionLost {
                target: self.target.id.to_string(),
                reason: "connection reset during close".to_string(),
            });
        }
        let before = state.recordings.len();
        state.recordings.retain(|r| r.descriptor.id != descriptor.id);
        if state.recordings.len() == before {
            return Err(Error::not_found("Recording", &descriptor.name));
        }
        Ok(())
    }

    async fn open_stream(&self, descriptor: &RecordingDescriptor) -> Result<RecordingStream> {
        let state = self.state()?;
        let recording = state
            .recordings
            .iter()
            .find(|r| r.descriptor.id == descriptor.id)
            .ok_or_else(|| Error::not_found("Recording", &descriptor.name))?;
        Ok(Box::pin(std::io::Cursor::new(recording.content.clone())))
    }

    async fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }
}
