//! Integration tests for the recording lifecycle

use chrono::{TimeZone, Utc};
use flightdeck::agent::memory::{MemoryConnector, MemoryTarget};
use flightdeck::agent::{
    EventTypeInfo, OptionKey, RecordingOptions, ServiceRef, StaticDiscovery, TargetId,
    TemplateType,
};
use flightdeck::protocol::{Notification, NotificationSender, RECORDING_CREATED};
use flightdeck::recordings::{
    Archive, FixedClock, RecordingOrchestrator, TemplateStore, ALL_EVENTS_TEMPLATE,
};
use flightdeck::reports::{ReportCache, ReportService, SummaryRenderer};
use flightdeck::session::{SessionManager, SessionManagerConfig};
use flightdeck::Error;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc::UnboundedReceiver;

const TARGET: &str = "localhost:9091";

struct Fixture {
    connector: Arc<MemoryConnector>,
    target: MemoryTarget,
    reports: Arc<ReportService>,
    templates: Arc<TemplateStore>,
    recordings: RecordingOrchestrator,
    feed: UnboundedReceiver<Notification>,
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let connector = Arc::new(MemoryConnector::new());
        let target = connector.add_target(TARGET);
        let sessions = Arc::new(SessionManager::new(
            connector.clone(),
            SessionManagerConfig::default(),
        ));
        let archive_dir = dir.path().join("recordings");
        let templates = Arc::new(TemplateStore::new(dir.path().join("templates")));
        let reports = Arc::new(ReportService::new(
            Arc::new(SummaryRenderer::new(Arc::clone(&sessions))),
            archive_dir.clone(),
            dir.path().join("reports"),
        ));
        let (notifications, feed) = NotificationSender::channel();
        let recordings = RecordingOrchestrator::new(
            sessions,
            Arc::clone(&templates),
            Arc::new(Archive::new(archive_dir)),
            reports.clone(),
            notifications,
        )
        .with_clock(Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )));

        Self {
            connector,
            target,
            reports,
            templates,
            recordings,
            feed,
            dir,
        }
    }

    fn target_id(&self) -> TargetId {
        TargetId::from(TARGET)
    }

    fn archive_path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join("recordings").join(name)
    }

    async fn start(&self, name: &str, template: &str) -> flightdeck::Result<()> {
        let options = RecordingOptions::builder(name).build().unwrap();
        self.recordings
            .start(&self.target_id(), options, template, None)
            .await
            .map(|_| ())
    }

    fn notifications(&mut self) -> Vec<Notification> {
        let mut received = Vec::new();
        while let Ok(notification) = self.feed.try_recv() {
            received.push(notification);
        }
        received
    }
}

#[tokio::test]
async fn test_start_emits_recording_created() {
    let mut fixture = Fixture::new();

    let options = RecordingOptions::builder("rec1").build().unwrap();
    let descriptor = fixture
        .recordings
        .start(&fixture.target_id(), options, ALL_EVENTS_TEMPLATE, None)
        .await
        .unwrap();
    assert_eq!(descriptor.name, "rec1");

    let notifications = fixture.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].category(), RECORDING_CREATED);
    assert_eq!(notifications[0].message()["recording"], "rec1");
    assert_eq!(notifications[0].message()["target"], TARGET);
}

#[tokio::test]
async fn test_duplicate_name_rejected_without_notification() {
    let mut fixture = Fixture::new();

    fixture.start("rec1", ALL_EVENTS_TEMPLATE).await.unwrap();
    let second = fixture.start("rec1", ALL_EVENTS_TEMPLATE).await;

    assert!(matches!(second, Err(Error::NameCollision { ref name }) if name == "rec1"));
    assert_eq!(fixture.target.start_calls(), 1);
    assert_eq!(fixture.notifications().len(), 1);
}

#[tokio::test]
async fn test_all_template_enables_every_event_type() {
    let fixture = Fixture::new();
    fixture.target.set_event_types(vec![
        EventTypeInfo::new("jdk.CPULoad", "CPU Load"),
        EventTypeInfo::new("jdk.ClassLoad", "Class Load"),
        EventTypeInfo::new("jdk.ObjectAllocationSample", "Object Allocation Sample"),
    ]);

    fixture.start("rec1", ALL_EVENTS_TEMPLATE).await.unwrap();

    let events = fixture
        .connector
        .last_started_events(&fixture.target_id())
        .unwrap();
    let mut enabled: Vec<&str> = events.event_ids().collect();
    enabled.sort();
    assert_eq!(
        enabled,
        vec!["jdk.CPULoad", "jdk.ClassLoad", "jdk.ObjectAllocationSample"]
    );
    assert!(enabled.iter().all(|id| events.is_enabled(id)));
}

#[tokio::test]
async fn test_custom_template_preferred_then_target() {
    let fixture = Fixture::new();
    fixture
        .templates
        .add_template(
            br#"
label = "SocketsOnly"

[events."jdk.SocketRead"]
enabled = true
"#,
        )
        .await
        .unwrap();

    fixture.start("custom", "SocketsOnly").await.unwrap();
    let events = fixture
        .connector
        .last_started_events(&fixture.target_id())
        .unwrap();
    assert_eq!(events.event_ids().collect::<Vec<_>>(), vec!["jdk.SocketRead"]);

    fixture.start("builtin", "Continuous").await.unwrap();
    let events = fixture
        .connector
        .last_started_events(&fixture.target_id())
        .unwrap();
    assert!(events.is_enabled("jdk.CPULoad"));
    assert!(!events.is_enabled("jdk.SocketRead"));
}

#[tokio::test]
async fn test_unknown_template_names_both_inputs() {
    let mut fixture = Fixture::new();

    let result = fixture.start("rec1", "Nope").await;
    match result {
        Err(Error::UnknownTemplate {
            name,
            template_type,
        }) => {
            assert_eq!(name, "Nope");
            assert_eq!(template_type, "CUSTOM or TARGET");
        }
        other => panic!("Expected UnknownTemplate, got {:?}", other),
    }

    let options = RecordingOptions::builder("rec2").build().unwrap();
    let typed = fixture
        .recordings
        .start(
            &fixture.target_id(),
            options,
            "Profiling",
            Some(TemplateType::Custom),
        )
        .await;
    assert!(matches!(
        typed,
        Err(Error::UnknownTemplate { ref template_type, .. }) if template_type == "CUSTOM"
    ));

    assert_eq!(fixture.target.start_calls(), 0);
    assert!(fixture.notifications().is_empty());
}

#[tokio::test]
async fn test_save_appends_suffix_on_collision() {
    let fixture = Fixture::new();
    fixture.target.add_recording("rec", b"recording bytes");
    std::fs::create_dir_all(fixture.archive_path("")).unwrap();
    std::fs::write(fixture.archive_path("localhost_rec_20240101T000000.jfr"), b"").unwrap();

    let saved = fixture
        .recordings
        .save(&fixture.target_id(), "rec")
        .await
        .unwrap();

    assert_eq!(saved, "localhost_rec_20240101T000000.1.jfr");
    assert_eq!(
        std::fs::read(fixture.archive_path(&saved)).unwrap(),
        b"recording bytes"
    );
}

#[tokio::test]
async fn test_save_uses_discovered_alias() {
    let Fixture {
        target,
        recordings,
        dir,
        ..
    } = Fixture::new();
    let recordings = recordings.with_target_provider(Arc::new(StaticDiscovery::new(vec![
        ServiceRef {
            service_uri: format!("agent://{}", TARGET),
            alias: Some("es.andrewazor.demo.Main".to_string()),
        },
    ])));
    target.add_recording("rec.jfr", b"x");

    let saved = recordings
        .save(&TargetId::from(TARGET), "rec.jfr")
        .await
        .unwrap();

    assert_eq!(saved, "es-andrewazor-demo-Main_rec_20240101T000000.jfr");
    assert!(dir.path().join("recordings").join(&saved).exists());
}

#[tokio::test]
async fn test_save_missing_recording_is_not_found() {
    let fixture = Fixture::new();
    let result = fixture.recordings.save(&fixture.target_id(), "ghost").await;
    assert!(matches!(result, Err(Error::NotFound { .. })));
    assert!(fixture.recordings.list_archived().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_missing_leaves_unrelated_reports() {
    let fixture = Fixture::new();
    fixture.target.add_recording("other", b"x");
    fixture
        .reports
        .get_active(&fixture.target_id(), "other")
        .await
        .unwrap();

    let result = fixture.recordings.delete(&fixture.target_id(), "rec1").await;

    assert!(matches!(result, Err(Error::NotFound { .. })));
    assert!(fixture
        .reports
        .is_active_cached(&fixture.target_id(), "other"));
}

#[tokio::test]
async fn test_delete_evicts_report() {
    let fixture = Fixture::new();
    fixture.target.add_recording("rec1", b"x");
    fixture
        .reports
        .get_active(&fixture.target_id(), "rec1")
        .await
        .unwrap();

    fixture
        .recordings
        .delete(&fixture.target_id(), "rec1")
        .await
        .unwrap();

    assert!(!fixture.reports.is_active_cached(&fixture.target_id(), "rec1"));
    assert!(fixture.target.recording_names().is_empty());
}

#[tokio::test]
async fn test_failed_close_still_evicts_report() {
    let fixture = Fixture::new();
    fixture.target.add_recording("rec1", b"x");
    fixture
        .reports
        .get_active(&fixture.target_id(), "rec1")
        .await
        .unwrap();
    assert!(fixture.reports.is_active_cached(&fixture.target_id(), "rec1"));
    fixture.target.fail_next_close();

    let result = fixture.recordings.delete(&fixture.target_id(), "rec1").await;

    assert!(matches!(result, Err(Error::SessionLost { .. })));
    assert!(!fixture.reports.is_active_cached(&fixture.target_id(), "rec1"));
    assert_eq!(fixture.target.recording_names(), vec!["rec1".to_string()]);
}

#[tokio::test]
async fn test_delete_archived_evicts_report() {
    let fixture = Fixture::new();
    fixture.target.add_recording("rec", b"x");
    let saved = fixture
        .recordings
        .save(&fixture.target_id(), "rec")
        .await
        .unwrap();
    fixture.reports.get_archived(&saved).await.unwrap().unwrap();
    assert!(fixture.reports.is_archived_cached(&saved));

    fixture.recordings.delete_archived(&saved).await.unwrap();

    assert!(!fixture.reports.is_archived_cached(&saved));
    assert!(matches!(
        fixture.recordings.delete_archived(&saved).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_customizer_fills_unset_options() {
    let fixture = Fixture::new();
    let customizer = fixture.recordings.customizer();
    customizer.set(OptionKey::ToDisk, "true").unwrap();
    customizer.set(OptionKey::MaxAge, "30").unwrap();

    let options = fixture
        .recordings
        .build_options(RecordingOptions::builder("rec1").max_age(60))
        .unwrap();
    assert_eq!(options.to_disk, Some(true));
    assert_eq!(options.max_age, Some(60));

    let effective = fixture
        .recordings
        .effective_options(&fixture.target_id())
        .await
        .unwrap();
    assert_eq!(effective.to_disk.as_deref(), Some("true"));
    assert_eq!(effective.max_age.as_deref(), Some("30"));
    assert_eq!(effective.max_size.as_deref(), Some("0"));
}

#[tokio::test]
async fn test_list_templates_includes_all() {
    let fixture = Fixture::new();
    let names: Vec<String> = fixture
        .recordings
        .list_templates(&fixture.target_id())
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["Continuous", "Profiling", "ALL"]);
}
