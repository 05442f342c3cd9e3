//! HTTP plane and process wiring
//!
//! Routes are thin: every handler delegates to the recording orchestrator,
//! the template store or the report cache and maps [`Error`] to a status
//! code.

mod handlers;

pub use handlers::{StartRecordingRequest, TEMPLATE_FIELD};

use crate::agent::{AgentConnector, TargetProvider};
use crate::commands::{builtin_commands, CommandExecutor, CommandRegistry};
use crate::config::Config;
use crate::error::Error;
use crate::protocol::{Notification, NotificationSender};
use crate::recordings::{Archive, RecordingOrchestrator, TemplateStore};
use crate::reports::{ReportCache, ReportService, SummaryRenderer};
use crate::rules::RuleService;
use crate::server::{AuthManager, MessagingServer};
use crate::session::SessionManager;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Handler error: a core error or a bare status
#[derive(Debug)]
pub enum ApiError {
    Core(Error),
    Status(StatusCode, String),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError::Status(status, message.into())
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Core(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Core(err) => {
                let status = StatusCode::from_u16(err.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    tracing::error!("Request failed: {}", err);
                }
                (status, err.to_string())
            }
            ApiError::Status(status, message) => (status, message),
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub recordings: Arc<RecordingOrchestrator>,
    pub templates: Arc<TemplateStore>,
    pub reports: Arc<dyn ReportCache>,
    pub rules: Arc<RuleService>,
    pub auth: Arc<dyn AuthManager>,
}

/// API routes behind bearer authentication, merged with the WebSocket
/// endpoint. Unrouted paths are a 404.
pub fn router(state: AppState, messaging: Arc<MessagingServer>) -> Router {
    let api = Router::new()
        .route(
            "/api/v1/targets/:target_id/recordings",
            get(handlers::list_recordings).post(handlers::start_recording),
        )
        .route(
            "/api/v1/targets/:target_id/recordings/:name",
            delete(handlers::delete_recording).patch(handlers::patch_recording),
        )
        .route(
            "/api/v1/targets/:target_id/recordingOptions",
            get(handlers::recording_options),
        )
        .route(
            "/api/v1/targets/:target_id/templates",
            get(handlers::list_templates),
        )
        .route(
            "/api/v1/targets/:target_id/reports/:name",
            get(handlers::active_report),
        )
        .route("/api/v1/recordings", get(handlers::list_archived))
        .route("/api/v1/recordings/:name", delete(handlers::delete_archived))
        .route("/api/v1/reports/:name", get(handlers::archived_report))
        .route("/api/v1/templates", post(handlers::upload_template))
        .route("/api/v1/templates/:name", delete(handlers::delete_template))
        .route(
            "/api/v2/rules",
            get(handlers::list_rules).post(handlers::create_rule),
        )
        .route(
            "/api/v2/rules/:name",
            get(handlers::get_rule).delete(handlers::delete_rule),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ))
        .with_state(state);

    api.merge(messaging.router())
}

async fn require_bearer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim);
    match state.auth.validate_token(token).await {
        Ok(true) => next.run(req).await,
        Ok(false) => {
            tracing::warn!("Rejected unauthenticated request to {}", req.uri().path());
            ApiError::status(StatusCode::UNAUTHORIZED, "Authentication required").into_response()
        }
        Err(e) => ApiError::Core(e).into_response(),
    }
}

/// Every long-lived component of a running process
pub struct Services {
    pub sessions: Arc<SessionManager>,
    pub recordings: Arc<RecordingOrchestrator>,
    pub templates: Arc<TemplateStore>,
    pub reports: Arc<ReportService>,
    pub rules: Arc<RuleService>,
    pub messaging: Arc<MessagingServer>,
    pub commands: Arc<CommandRegistry>,
    pub notifications: NotificationSender,
    notification_feed: Option<mpsc::UnboundedReceiver<Notification>>,
}

impl Services {
    pub fn build(
        config: &Config,
        connector: Arc<dyn AgentConnector>,
        targets: Arc<dyn TargetProvider>,
    ) -> anyhow::Result<Self> {
        let auth = config.auth_manager()?;
        tracing::info!("Using auth manager {}", auth.name());

        let sessions = Arc::new(SessionManager::new(
            connector,
            config.session_manager_config(),
        ));
        let archive = Arc::new(Archive::new(config.recordings_dir()));
        let templates = Arc::new(TemplateStore::new(config.templates_dir()));
        let reports = Arc::new(ReportService::new(
            Arc::new(SummaryRenderer::new(Arc::clone(&sessions))),
            config.recordings_dir(),
            config.reports_dir(),
        ));
        let (notifications, notification_feed) = NotificationSender::channel();

        let recordings = Arc::new(
            RecordingOrchestrator::new(
                Arc::clone(&sessions),
                Arc::clone(&templates),
                archive,
                Arc::clone(&reports) as Arc<dyn ReportCache>,
                notifications.clone(),
            )
            .with_target_provider(Arc::clone(&targets)),
        );
        let rules = Arc::new(RuleService::new(
            config.rules_dir(),
            Arc::clone(&recordings),
            targets,
        ));
        let messaging = Arc::new(MessagingServer::new(
            config.messaging.max_connections,
            auth,
        ));
        let commands = Arc::new(CommandRegistry::new(builtin_commands(Arc::clone(
            &recordings,
        )))?);

        Ok(Self {
            sessions,
            recordings,
            templates,
            reports,
            rules,
            messaging,
            commands,
            notifications,
            notification_feed: Some(notification_feed),
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            recordings: Arc::clone(&self.recordings),
            templates: Arc::clone(&self.templates),
            reports: Arc::clone(&self.reports) as Arc<dyn ReportCache>,
            rules: Arc::clone(&self.rules),
            auth: Arc::clone(self.messaging.auth()),
        }
    }

    pub fn router(&self) -> Router {
        router(self.app_state(), Arc::clone(&self.messaging))
    }

    /// Start the notification pump and the command executor
    pub fn start_background(&mut self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(feed) = self.notification_feed.take() {
            handles.push(self.messaging.spawn_notification_pump(feed));
        }
        handles.push(
            CommandExecutor::new(Arc::clone(&self.messaging), Arc::clone(&self.commands)).spawn(),
        );
        handles
    }
}

/// Serve both planes on the configured address until `shutdown` resolves
pub async fn serve(
    config: Config,
    connector: Arc<dyn AgentConnector>,
    targets: Arc<dyn TargetProvider>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let mut services = Services::build(&config, connector, targets)?;
    let mut background = services.start_background();
    background.push(services.sessions.spawn_reaper(config.reap_interval()));
    services.rules.load().await?;
    background.push(services.rules.spawn_sweeper(config.rules_sweep_interval()));

    let listener = tokio::net::TcpListener::bind(&config.general.listen).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    let app = services.router();
    let messaging = Arc::clone(&services.messaging);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        tracing::info!("Shutdown signal received");
        messaging.shutdown();
    })
    .await?;

    for handle in background {
        handle.abort();
    }
    services.sessions.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}
