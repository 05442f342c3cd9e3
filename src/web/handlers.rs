//! HTTP handlers over the recording orchestrator, the template store, the
//! report cache and the rule registry

use super::{ApiError, ApiResult, AppState};
use crate::agent::{EventTemplate, RecordingDescriptor, RecordingOptions, TargetId};
use crate::error::Error;
use crate::recordings::{parse_event_specifier, EffectiveOptions};
use crate::reports::ReportCache;
use crate::rules::Rule;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::Json;
use serde::Deserialize;

/// Form field carrying an uploaded template
pub const TEMPLATE_FIELD: &str = "template";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRecordingRequest {
    pub recording_name: String,

    /// Seconds; continuous when absent
    #[serde(default)]
    pub duration: Option<u64>,

    /// `template=NAME[,type=TYPE]`
    pub events: String,
}

pub async fn list_recordings(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> ApiResult<Json<Vec<RecordingDescriptor>>> {
    let recordings = state.recordings.list(&TargetId::from(target)).await?;
    Ok(Json(recordings))
}

pub async fn start_recording(
    State(state): State<AppState>,
    Path(target): Path<String>,
    Json(request): Json<StartRecordingRequest>,
) -> ApiResult<(StatusCode, Json<RecordingDescriptor>)> {
    let mut builder = RecordingOptions::builder(request.recording_name);
    if let Some(duration) = request.duration {
        builder = builder.duration(duration);
    }
    let options = state.recordings.build_options(builder)?;
    let (template, template_type) = parse_event_specifier(&request.events)?;
    let descriptor = state
        .recordings
        .start(&TargetId::from(target), options, &template, template_type)
        .await?;
    Ok((StatusCode::CREATED, Json(descriptor)))
}

/// The only supported body is `save`
pub async fn patch_recording(
    State(state): State<AppState>,
    Path((target, name)): Path<(String, String)>,
    body: String,
) -> ApiResult<String> {
    match body.trim().to_ascii_lowercase().as_str() {
        "save" => Ok(state.recordings.save(&TargetId::from(target), &name).await?),
        other => Err(ApiError::status(
            StatusCode::BAD_REQUEST,
            format!("Unsupported operation {}", other),
        )),
    }
}

pub async fn delete_recording(
    State(state): State<AppState>,
    Path((target, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .recordings
        .delete(&TargetId::from(target), &name)
        .await?;
    Ok(StatusCode::OK)
}

pub async fn recording_options(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> ApiResult<Json<EffectiveOptions>> {
    let options = state
        .recordings
        .effective_options(&TargetId::from(target))
        .await?;
    Ok(Json(options))
}

pub async fn list_templates(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> ApiResult<Json<Vec<EventTemplate>>> {
    let templates = state
        .recordings
        .list_templates(&TargetId::from(target))
        .await?;
    Ok(Json(templates))
}

pub async fn list_archived(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.recordings.list_archived().await?))
}

/// 404 if absent, 500 on I/O failure. The stored report is evicted in
/// every case.
pub async fn delete_archived(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.recordings.delete_archived(&name).await?;
    Ok(StatusCode::OK)
}

pub async fn active_report(
    State(state): State<AppState>,
    Path((target, name)): Path<(String, String)>,
) -> ApiResult<Html<String>> {
    let report = state
        .reports
        .get_active(&TargetId::from(target), &name)
        .await?;
    Ok(Html(report))
}

pub async fn archived_report(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Html<String>> {
    let path = state
        .reports
        .get_archived(&name)
        .await?
        .ok_or_else(|| Error::not_found("Recording", name.as_str()))?;
    let report = tokio::fs::read_to_string(&path).await.map_err(Error::from)?;
    Ok(Html(report))
}

/// Multipart upload. Only the `template` field is read, any other field is
/// ignored.
pub async fn upload_template(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<EventTemplate>> {
    let mut uploaded = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::status(e.status(), e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name != TEMPLATE_FIELD {
            tracing::warn!("Received unexpected file upload named {}", name);
            continue;
        }
        let content = field
            .bytes()
            .await
            .map_err(|e| ApiError::status(e.status(), e.body_text()))?;
        uploaded = Some(state.templates.add_template(&content).await?);
    }
    uploaded
        .map(Json)
        .ok_or_else(|| ApiError::status(StatusCode::BAD_REQUEST, "No template submitted"))
}

pub async fn delete_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.templates.delete(&name).await?;
    Ok(StatusCode::OK)
}

pub async fn list_rules(State(state): State<AppState>) -> Json<Vec<Rule>> {
    Json(state.rules.list())
}

/// 201 on success, 409 for a taken name, 415 without a JSON content type
/// and 400 for anything else malformed
pub async fn create_rule(
    State(state): State<AppState>,
    payload: Result<Json<Rule>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Rule>)> {
    let Json(rule) = payload.map_err(|rejection| {
        let status = if matches!(rejection, JsonRejection::MissingJsonContentType(_)) {
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        } else {
            StatusCode::BAD_REQUEST
        };
        ApiError::status(status, rejection.body_text())
    })?;
    let rule = state.rules.add(rule).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn get_rule(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Rule>> {
    let rule = state
        .rules
        .get(&name)
        .ok_or_else(|| Error::not_found("Rule", name.as_str()))?;
    Ok(Json(rule))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.rules.delete(&name).await?;
    Ok(StatusCode::OK)
}
