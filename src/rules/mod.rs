//! Automated rules - start a recording on every discovered target that
//! matches an expression
//!
//! Rules are persisted one JSON document per rule. A rule is applied when
//! it is added and again on every sweep, so targets discovered later pick
//! it up too.

mod matcher;

pub use matcher::{Field, MatchExpression};

use crate::agent::{RecordingOptions, TargetId, TargetProvider};
use crate::error::{Error, Result};
use crate::recordings::{parse_event_specifier, RecordingOrchestrator};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Prefix of recordings started by a rule
pub const RULE_RECORDING_PREFIX: &str = "auto_";

const RULE_EXTENSION: &str = "json";

/// A rule as submitted over HTTP and stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub match_expression: String,

    /// `template=NAME[,type=TYPE]`
    pub event_specifier: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size_bytes: Option<u64>,
}

impl Rule {
    /// Check every field, reporting the first that fails
    pub fn validate(&self) -> Result<()> {
        static NAME: OnceLock<Regex> = OnceLock::new();
        let name = NAME.get_or_init(|| Regex::new(r"^\w[\w\-]*$").expect("static pattern"));
        if !name.is_match(&self.name) {
            return Err(Error::InvalidRule(format!(
                "\"{}\" is an invalid rule name",
                self.name
            )));
        }
        parse_event_specifier(&self.event_specifier)
            .map_err(|e| Error::InvalidRule(e.to_string()))?;
        self.matcher()?;
        Ok(())
    }

    pub fn matcher(&self) -> Result<MatchExpression> {
        MatchExpression::parse(&self.match_expression)
    }

    /// Name of the recording this rule starts on each target
    pub fn recording_name(&self) -> String {
        format!("{}{}", RULE_RECORDING_PREFIX, self.name)
    }
}

/// Registry of rules and the loop that applies them
pub struct RuleService {
    dir: PathBuf,
    rules: Mutex<BTreeMap<String, Rule>>,
    recordings: Arc<RecordingOrchestrator>,
    targets: Arc<dyn TargetProvider>,
}

impl RuleService {
    pub fn new(
        dir: impl Into<PathBuf>,
        recordings: Arc<RecordingOrchestrator>,
        targets: Arc<dyn TargetProvider>,
    ) -> Self {
        Self {
            dir: dir.into(),
            rules: Mutex::new(BTreeMap::new()),
            recordings,
            targets,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn rules(&self) -> MutexGuard<'_, BTreeMap<String, Rule>> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rule_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, RULE_EXTENSION))
    }

    /// Read persisted rules. Unreadable or invalid documents are skipped
    /// with a warning. Returns the number of rules loaded.
    pub async fn load(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RULE_EXTENSION) {
                continue;
            }
            let rule = match tokio::fs::read(&path).await {
                Ok(content) => serde_json::from_slice::<Rule>(&content)
                    .map_err(Error::from)
                    .and_then(|rule| rule.validate().map(|()| rule)),
                Err(e) => Err(e.into()),
            };
            match rule {
                Ok(rule) => {
                    self.rules().insert(rule.name.clone(), rule);
                    loaded += 1;
                }
                Err(e) => tracing::warn!("Skipping rule file {}: {}", path.display(), e),
            }
        }
        tracing::info!("Loaded {} rule(s) from {}", loaded, self.dir.display());
        Ok(loaded)
    }

    /// Validate, persist and apply a new rule
    pub async fn add(&self, rule: Rule) -> Result<Rule> {
        rule.validate()?;
        {
            let mut rules = self.rules();
            if rules.contains_key(&rule.name) {
                return Err(Error::RuleExists { name: rule.name });
            }
            rules.insert(rule.name.clone(), rule.clone());
        }

        if let Err(e) = self.persist(&rule).await {
            self.rules().remove(&rule.name);
            return Err(e);
        }
        tracing::info!("Added rule {}", rule.name);

        self.apply(&rule).await;
        Ok(rule)
    }

    async fn persist(&self, rule: &Rule) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let content = serde_json::to_vec_pretty(rule)?;
        tokio::fs::write(self.rule_path(&rule.name), content).await?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Rule> {
        self.rules().get(name).cloned()
    }

    /// Every rule, ordered by name
    pub fn list(&self) -> Vec<Rule> {
        self.rules().values().cloned().collect()
    }

    /// Forget a rule. Recordings it already started keep running.
    pub async fn delete(&self, name: &str) -> Result<()> {
        if self.rules().remove(name).is_none() {
            return Err(Error::not_found("Rule", name));
        }
        match tokio::fs::remove_file(self.rule_path(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!("Deleted rule {}", name);
        Ok(())
    }

    /// Start the rule's recording on every matching discovered target.
    /// Returns the targets a recording was started on; targets already
    /// carrying it are skipped.
    pub async fn apply(&self, rule: &Rule) -> Vec<TargetId> {
        let matcher = match rule.matcher() {
            Ok(matcher) => matcher,
            Err(e) => {
                tracing::warn!("Rule {} has an invalid match expression: {}", rule.name, e);
                return Vec::new();
            }
        };
        let services = match self.targets.list_discoverable_services().await {
            Ok(services) => services,
            Err(e) => {
                tracing::warn!("Target discovery failed, rule {} not applied: {}", rule.name, e);
                return Vec::new();
            }
        };

        let mut started = Vec::new();
        for service in services.iter().filter(|s| matcher.matches(s)) {
            let target = service.target_id();
            match self.start_on(rule, &target).await {
                Ok(()) => started.push(target),
                Err(Error::NameCollision { .. }) => {
                    tracing::debug!("Rule {} already active on {}", rule.name, target);
                }
                Err(e) => tracing::warn!("Rule {} failed on {}: {}", rule.name, target, e),
            }
        }
        started
    }

    async fn start_on(&self, rule: &Rule, target: &TargetId) -> Result<()> {
        let mut builder = RecordingOptions::builder(rule.recording_name());
        if let Some(seconds) = rule.max_age_seconds {
            builder = builder.max_age(seconds);
        }
        if let Some(bytes) = rule.max_size_bytes {
            builder = builder.max_size(bytes);
        }
        let options = self.recordings.build_options(builder)?;
        let (template, template_type) = parse_event_specifier(&rule.event_specifier)?;
        self.recordings
            .start(target, options, &template, template_type)
            .await?;
        tracing::info!("Rule {} started {} on {}", rule.name, rule.recording_name(), target);
        Ok(())
    }

    /// Apply every rule once. Returns the number of recordings started.
    pub async fn sweep(&self) -> usize {
        let mut started = 0;
        for rule in self.list() {
            started += self.apply(&rule).await.len();
        }
        started
    }

    /// Periodically sweep so newly discovered targets pick up rules
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let started = service.sweep().await;
                if started > 0 {
                    tracing::debug!("Rule sweep started {} recording(s)", started);
                }
            }
        })
    }
}
