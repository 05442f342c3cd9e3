//! Report cache - rendered analysis reports for active and archived
//! recordings
//!
//! Rendering itself is delegated to a [`ReportRenderer`]; this module only
//! owns memoisation and eviction.

use crate::agent::TargetId;
use crate::error::{Error, Result};
use crate::session::SessionManager;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Keyed lookup and eviction of rendered reports
#[async_trait]
pub trait ReportCache: Send + Sync {
    /// Report for a recording live on a target
    async fn get_active(&self, target: &TargetId, recording: &str) -> Result<String>;

    /// Stored report for an archived recording, `None` if the recording is
    /// not in the archive
    async fn get_archived(&self, recording: &str) -> Result<Option<PathBuf>>;

    /// Evict an active report. A render still in flight for the same
    /// recording is not stored when it completes. Returns whether a report
    /// or a render was invalidated.
    fn delete_active(&self, target: &TargetId, recording: &str) -> bool;

    /// Evict an archived report. Returns whether anything was cached.
    async fn delete_archived(&self, recording: &str) -> bool;
}

/// Produces report documents
#[async_trait]
pub trait ReportRenderer: Send + Sync {
    async fn render_active(&self, target: &TargetId, recording: &str) -> Result<String>;

    async fn render_archived(&self, recording_path: &Path) -> Result<String>;
}

type ActiveKey = (TargetId, String);

#[derive(Default)]
struct ActiveReports {
    reports: HashMap<ActiveKey, String>,

    /// Ticket of the render in flight per key. Eviction drops the ticket,
    /// so a render that started before it cannot store its result.
    renders: HashMap<ActiveKey, u64>,

    next_ticket: u64,
}

/// Whether `recording` names a file directly inside the archive
fn is_archive_entry(recording: &str) -> bool {
    !recording.is_empty()
        && Path::new(recording).file_name().and_then(|n| n.to_str()) == Some(recording)
}

/// In-memory [`ReportCache`] backed by a renderer
pub struct ReportService {
    renderer: Arc<dyn ReportRenderer>,
    archive_dir: PathBuf,
    reports_dir: PathBuf,
    active: Mutex<ActiveReports>,
    archived: Mutex<HashMap<String, PathBuf>>,
}

impl ReportService {
    pub fn new(
        renderer: Arc<dyn ReportRenderer>,
        archive_dir: impl Into<PathBuf>,
        reports_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            renderer,
            archive_dir: archive_dir.into(),
            reports_dir: reports_dir.into(),
            active: Mutex::new(ActiveReports::default()),
            archived: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a rendered report for the active recording is stored
    pub fn is_active_cached(&self, target: &TargetId, recording: &str) -> bool {
        lock(&self.active)
            .reports
            .contains_key(&(target.clone(), recording.to_string()))
    }

    /// Whether a rendered report for the archived recording is stored
    pub fn is_archived_cached(&self, recording: &str) -> bool {
        lock(&self.archived).contains_key(recording)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl ReportCache for ReportService {
    async fn get_active(&self, target: &TargetId, recording: &str) -> Result<String> {
        let key = (target.clone(), recording.to_string());
        let ticket = {
            let mut active = lock(&self.active);
            if let Some(report) = active.reports.get(&key) {
                return Ok(report.clone());
            }
            match active.renders.get(&key) {
                Some(ticket) => *ticket,
                None => {
                    active.next_ticket += 1;
                    let ticket = active.next_ticket;
                    active.renders.insert(key.clone(), ticket);
                    ticket
                }
            }
        };

        let rendered = self.renderer.render_active(target, recording).await;

        let mut active = lock(&self.active);
        let current = active.renders.get(&key) == Some(&ticket);
        if current {
            active.renders.remove(&key);
        }
        let report = rendered?;
        if current {
            active.reports.insert(key, report.clone());
        } else {
            tracing::debug!(
                "Report for {} on {} was evicted while rendering, not storing it",
                recording,
                target
            );
        }
        Ok(report)
    }

    async fn get_archived(&self, recording: &str) -> Result<Option<PathBuf>> {
        if !is_archive_entry(recording) {
            tracing::warn!("Refusing report for {:?}: not an archive entry", recording);
            return Ok(None);
        }

        let cached = lock(&self.archived).get(recording).cloned();
        if let Some(path) = cached {
            if tokio::fs::try_exists(&path).await? {
                return Ok(Some(path));
            }
        }

        let recording_path = self.archive_dir.join(recording);
        if !tokio::fs::try_exists(&recording_path).await? {
            return Ok(None);
        }
        let report = self.renderer.render_archived(&recording_path).await?;
        tokio::fs::create_dir_all(&self.reports_dir).await?;
        let report_path = self.reports_dir.join(format!("{}.report.html", recording));
        tokio::fs::write(&report_path, report).await?;
        lock(&self.archived).insert(recording.to_string(), report_path.clone());
        Ok(Some(report_path))
    }

    fn delete_active(&self, target: &TargetId, recording: &str) -> bool {
        let key = (target.clone(), recording.to_string());
        let mut active = lock(&self.active);
        let report = active.reports.remove(&key).is_some();
        let render = active.renders.remove(&key).is_some();
        if report || render {
            tracing::debug!("Evicted report for {} on {}", recording, target);
        }
        report || render
    }

    async fn delete_archived(&self, recording: &str) -> bool {
        let removed = lock(&self.archived).remove(recording);
        let Some(path) = removed else {
            return false;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove report {}: {}", path.display(), e),
        }
        tracing::debug!("Evicted archived report for {}", recording);
        true
    }
}

/// Renders a plain summary page from recording metadata
pub struct SummaryRenderer {
    sessions: Arc<SessionManager>,
}

impl SummaryRenderer {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl ReportRenderer for SummaryRenderer {
    async fn render_active(&self, target: &TargetId, recording: &str) -> Result<String> {
        let descriptor = self
            .sessions
            .run(target, |session| async move {
                let recordings = session.list_recordings().await?;
                recordings
                    .into_iter()
                    .find(|r| r.name == recording)
                    .ok_or_else(|| Error::not_found("Recording", recording))
            })
            .await?;
        Ok(format!(
            "<html><body><h1>{}</h1><p>Target: {}</p><p>State: {:?}</p><p>Started: {}</p></body></html>",
            descriptor.name,
            target,
            descriptor.state,
            descriptor.start_time.to_rfc3339()
        ))
    }

    async fn render_archived(&self, recording_path: &Path) -> Result<String> {
        let metadata = tokio::fs::metadata(recording_path).await?;
        let name = recording_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!(
            "<html><body><h1>{}</h1><p>Size: {} bytes</p></body></html>",
            name,
            metadata.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct CountingRenderer {
        renders: AtomicUsize,
    }

    #[async_trait]
    impl ReportRenderer for CountingRenderer {
        async fn render_active(&self, target: &TargetId, recording: &str) -> Result<String> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}/{}", target, recording))
        }

        async fn render_archived(&self, recording_path: &Path) -> Result<String> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            Ok(recording_path.display().to_string())
        }
    }

    #[tokio::test]
    async fn test_active_reports_are_memoised() {
        let renderer = Arc::new(CountingRenderer::default());
        let dir = tempdir().unwrap();
        let service = ReportService::new(renderer.clone(), dir.path(), dir.path().join("reports"));
        let target = TargetId::from("localhost:9091");

        assert_eq!(service.get_active(&target, "rec").await.unwrap(), "localhost:9091/rec");
        service.get_active(&target, "rec").await.unwrap();
        assert_eq!(renderer.renders.load(Ordering::SeqCst), 1);

        assert!(service.delete_active(&target, "rec"));
        assert!(!service.delete_active(&target, "rec"));
        service.get_active(&target, "rec").await.unwrap();
        assert_eq!(renderer.renders.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_archived_report_for_missing_recording() {
        let dir = tempdir().unwrap();
        let service = ReportService::new(
            Arc::new(CountingRenderer::default()),
            dir.path(),
            dir.path().join("reports"),
        );
        assert!(service.get_archived("absent.jfr").await.unwrap().is_none());
        assert!(!service.delete_archived("absent.jfr").await);
    }

    #[tokio::test]
    async fn test_archived_report_written_and_evicted() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a_rec_1.jfr"), b"data").unwrap();
        let service = ReportService::new(
            Arc::new(CountingRenderer::default()),
            dir.path(),
            dir.path().join("reports"),
        );

        let path = service.get_archived("a_rec_1.jfr").await.unwrap().unwrap();
        assert!(path.exists());
        assert!(service.is_archived_cached("a_rec_1.jfr"));

        assert!(service.delete_archived("a_rec_1.jfr").await);
        assert!(!path.exists());
        assert!(!service.is_archived_cached("a_rec_1.jfr"));
    }

    #[tokio::test]
    async fn test_archived_names_outside_archive_rejected() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("recordings");
        std::fs::create_dir_all(&archive).unwrap();
        let secret = dir.path().join("secret.txt");
        std::fs::write(&secret, b"secret").unwrap();
        let renderer = Arc::new(CountingRenderer::default());
        let service = ReportService::new(renderer.clone(), archive, dir.path().join("reports"));

        for name in ["../secret.txt", secret.to_str().unwrap(), "..", ""] {
            assert!(service.get_archived(name).await.unwrap().is_none(), "{}", name);
        }
        assert_eq!(renderer.renders.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("secret.txt.report.html").exists());
        assert!(!dir.path().join("reports").exists());
    }

    #[derive(Default)]
    struct GatedRenderer {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ReportRenderer for GatedRenderer {
        async fn render_active(&self, target: &TargetId, recording: &str) -> Result<String> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(format!("{}/{}", target, recording))
        }

        async fn render_archived(&self, recording_path: &Path) -> Result<String> {
            Ok(recording_path.display().to_string())
        }
    }

    #[tokio::test]
    async fn test_eviction_during_render_wins() {
        let renderer = Arc::new(GatedRenderer::default());
        let dir = tempdir().unwrap();
        let service = Arc::new(ReportService::new(
            renderer.clone(),
            dir.path(),
            dir.path().join("reports"),
        ));
        let target = TargetId::from("localhost:9091");

        let render = tokio::spawn({
            let service = Arc::clone(&service);
            let target = target.clone();
            async move { service.get_active(&target, "rec").await }
        });
        renderer.started.notified().await;
        assert!(service.delete_active(&target, "rec"));
        renderer.release.notify_one();

        assert_eq!(render.await.unwrap().unwrap(), "localhost:9091/rec");
        assert!(!service.is_active_cached(&target, "rec"));
    }
}
