//! HTTP request handlers for the REST API.
//!
//! Handlers translate request bodies into calls on [`ServerState`] and its components. Errors
//! are returned as [`SandcoreError`], which renders itself as an [`ErrorResponse`].
//!
//! [`ErrorResponse`]: super::types::ErrorResponse

use std::{collections::BTreeMap, time::Duration};

use axum::{
    body::Bytes,
    extract::{Path, Query, RawQuery, State},
    http::{HeaderMap, Method, StatusCode},
    response::Response,
    Json,
};
use serde::de::DeserializeOwned;

use super::{
    state::ServerState,
    types::{
        ApiJson, BackgroundRequest, ContentResponse, CreateSandboxRequest, CreateSandboxResponse,
        DeletedResponse, EntriesResponse, ExecBody, JobResponse, ListFilesQuery, MountRequest,
        PreviewRequest, PreviewStatus, RegisterPreviewRequest, RestoredResponse, SnapshotRequest,
        StatusResponse, StoppedResponse, SuccessResponse, UrlResponse, WriteFileRequest,
    },
};
use crate::{
    fallback::{FallbackStatus, SnapshotInfo},
    preview::ProxyRequest,
    runtime::{ExecOutcome, ExecRequest, SandboxSummary, SandboxUsage, UsageTotals},
    SandcoreError, SandcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

type ApiResult<T> = SandcoreResult<Json<T>>;

//--------------------------------------------------------------------------------------------------
// Functions: Sandboxes
//--------------------------------------------------------------------------------------------------

/// Handler for the POST /sandboxes endpoint
pub async fn create_sandbox(
    State(state): State<ServerState>,
    body: Bytes,
) -> SandcoreResult<(StatusCode, Json<CreateSandboxResponse>)> {
    let request: CreateSandboxRequest = optional_json(&body)?;
    let summary = state.manager().create_sandbox(request.sandbox_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSandboxResponse {
            sandbox_id: summary.sandbox_id,
            workspace: summary.workspace,
        }),
    ))
}

/// Handler for the GET /sandboxes endpoint
pub async fn list_sandboxes(State(state): State<ServerState>) -> Json<Vec<SandboxSummary>> {
    Json(state.manager().list_sandboxes().await)
}

/// Handler for the GET /sandboxes/{sandbox_id} endpoint
pub async fn get_sandbox(
    State(state): State<ServerState>,
    Path(sandbox_id): Path<String>,
) -> ApiResult<SandboxSummary> {
    Ok(Json(state.manager().get_sandbox(&sandbox_id).await?))
}

/// Handler for the DELETE /sandboxes/{sandbox_id} endpoint
pub async fn delete_sandbox(
    State(state): State<ServerState>,
    Path(sandbox_id): Path<String>,
) -> ApiResult<DeletedResponse> {
    state.destroy_sandbox(&sandbox_id).await?;
    Ok(Json(DeletedResponse { deleted: true }))
}

/// Handler for the POST /sandboxes/{sandbox_id}/exec endpoint
///
/// Quota exhaustion, delegation and timeouts all come back as 200 with the matching body.
pub async fn exec_command(
    State(state): State<ServerState>,
    Path(sandbox_id): Path<String>,
    ApiJson(body): ApiJson<ExecBody>,
) -> ApiResult<ExecOutcome> {
    let timeout = body.timeout.map(seconds).transpose()?;
    let request = ExecRequest {
        command: body.command,
        args: body.args,
        code: body.code,
        timeout,
        requires_native: body.requires_native,
    };

    Ok(Json(state.manager().exec_command(&sandbox_id, request).await?))
}

/// Handler for the POST /sandboxes/{sandbox_id}/keepalive endpoint
pub async fn keep_alive(
    State(state): State<ServerState>,
    Path(sandbox_id): Path<String>,
) -> ApiResult<StatusResponse> {
    state.manager().keep_alive(&sandbox_id).await?;
    Ok(Json(StatusResponse::ok()))
}

/// Handler for the POST /sandboxes/{sandbox_id}/mount endpoint
pub async fn mount(
    State(state): State<ServerState>,
    Path(sandbox_id): Path<String>,
    ApiJson(body): ApiJson<MountRequest>,
) -> ApiResult<SuccessResponse> {
    state.mount(&sandbox_id, &body.alias, &body.target).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// Handler for the POST /sandboxes/{sandbox_id}/preview endpoint
pub async fn expose_preview(
    State(state): State<ServerState>,
    Path(sandbox_id): Path<String>,
    ApiJson(body): ApiJson<PreviewRequest>,
) -> ApiResult<UrlResponse> {
    let url = state.expose_preview(&sandbox_id, body.port).await?;
    Ok(Json(UrlResponse { url }))
}

//--------------------------------------------------------------------------------------------------
// Functions: Files
//--------------------------------------------------------------------------------------------------

/// Handler for the POST /sandboxes/{sandbox_id}/files endpoint
pub async fn write_file(
    State(state): State<ServerState>,
    Path(sandbox_id): Path<String>,
    ApiJson(body): ApiJson<WriteFileRequest>,
) -> ApiResult<SuccessResponse> {
    state
        .manager()
        .write_file(&sandbox_id, &body.path, body.data.into_bytes())
        .await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// Handler for the GET /sandboxes/{sandbox_id}/files endpoint
pub async fn list_files(
    State(state): State<ServerState>,
    Path(sandbox_id): Path<String>,
    Query(query): Query<ListFilesQuery>,
) -> ApiResult<EntriesResponse> {
    let entries = state.manager().list_files(&sandbox_id, &query.path).await?;
    Ok(Json(EntriesResponse { entries }))
}

/// Handler for the GET /sandboxes/{sandbox_id}/files/{*path} endpoint
pub async fn read_file(
    State(state): State<ServerState>,
    Path((sandbox_id, path)): Path<(String, String)>,
) -> ApiResult<ContentResponse> {
    let data = state.manager().read_file(&sandbox_id, &path).await?;
    Ok(Json(ContentResponse {
        content: String::from_utf8_lossy(&data).into_owned(),
    }))
}

//--------------------------------------------------------------------------------------------------
// Functions: Background Jobs
//--------------------------------------------------------------------------------------------------

/// Handler for the POST /sandboxes/{sandbox_id}/background endpoint
pub async fn start_background(
    State(state): State<ServerState>,
    Path(sandbox_id): Path<String>,
    ApiJson(body): ApiJson<BackgroundRequest>,
) -> ApiResult<JobResponse> {
    let interval = seconds(body.interval)?;
    let job = state
        .background()
        .start_job(&sandbox_id, body.command, body.args, interval)
        .await?;

    Ok(Json(JobResponse {
        job_id: job.job_id().to_string(),
    }))
}

/// Handler for the DELETE /sandboxes/{sandbox_id}/background/{job_id} endpoint
pub async fn stop_background(
    State(state): State<ServerState>,
    Path((sandbox_id, job_id)): Path<(String, String)>,
) -> ApiResult<StoppedResponse> {
    if !state.background().stop_job(&sandbox_id, &job_id).await? {
        return Err(SandcoreError::JobNotFound { sandbox_id, job_id });
    }

    Ok(Json(StoppedResponse { stopped: true }))
}

//--------------------------------------------------------------------------------------------------
// Functions: Snapshots
//--------------------------------------------------------------------------------------------------

/// Handler for the POST /sandboxes/{sandbox_id}/snapshots endpoint
pub async fn create_snapshot(
    State(state): State<ServerState>,
    Path(sandbox_id): Path<String>,
    body: Bytes,
) -> SandcoreResult<(StatusCode, Json<SnapshotInfo>)> {
    ensure_sandbox(&state, &sandbox_id).await?;
    let request: SnapshotRequest = optional_json(&body)?;
    let info = state
        .orchestrator()
        .workspace()
        .create_snapshot(&sandbox_id, request.snapshot_id.as_deref())
        .await?;

    Ok((StatusCode::CREATED, Json(info)))
}

/// Handler for the GET /sandboxes/{sandbox_id}/snapshots endpoint
pub async fn list_snapshots(
    State(state): State<ServerState>,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Vec<SnapshotInfo>> {
    ensure_sandbox(&state, &sandbox_id).await?;
    Ok(Json(
        state
            .orchestrator()
            .workspace()
            .list_snapshots(&sandbox_id)
            .await?,
    ))
}

/// Handler for the POST /sandboxes/{sandbox_id}/snapshots/{snapshot_id}/restore endpoint
pub async fn restore_snapshot(
    State(state): State<ServerState>,
    Path((sandbox_id, snapshot_id)): Path<(String, String)>,
) -> ApiResult<RestoredResponse> {
    ensure_sandbox(&state, &sandbox_id).await?;
    state
        .orchestrator()
        .workspace()
        .restore_snapshot(&sandbox_id, &snapshot_id)
        .await?;

    Ok(Json(RestoredResponse { restored: true }))
}

/// Handler for the DELETE /sandboxes/{sandbox_id}/snapshots/{snapshot_id} endpoint
pub async fn delete_snapshot(
    State(state): State<ServerState>,
    Path((sandbox_id, snapshot_id)): Path<(String, String)>,
) -> ApiResult<DeletedResponse> {
    ensure_sandbox(&state, &sandbox_id).await?;
    let deleted = state
        .orchestrator()
        .workspace()
        .delete_snapshot(&sandbox_id, &snapshot_id)
        .await?;

    if !deleted {
        return Err(SandcoreError::SnapshotNotFound(format!(
            "{sandbox_id}/{snapshot_id}"
        )));
    }

    Ok(Json(DeletedResponse { deleted: true }))
}

//--------------------------------------------------------------------------------------------------
// Functions: Usage And Fallback
//--------------------------------------------------------------------------------------------------

/// Handler for the GET /sandboxes/{sandbox_id}/usage endpoint
pub async fn sandbox_usage(
    State(state): State<ServerState>,
    Path(sandbox_id): Path<String>,
) -> ApiResult<SandboxUsage> {
    Ok(Json(state.sandbox_usage(&sandbox_id).await?))
}

/// Handler for the GET /usage endpoint
pub async fn total_usage(State(state): State<ServerState>) -> ApiResult<UsageTotals> {
    Ok(Json(state.total_usage().await?))
}

/// Handler for the GET /fallback endpoint
pub async fn list_fallbacks(State(state): State<ServerState>) -> Json<Vec<FallbackStatus>> {
    Json(state.orchestrator().list().await)
}

//--------------------------------------------------------------------------------------------------
// Functions: Preview
//--------------------------------------------------------------------------------------------------

/// Handler for the POST /preview/register endpoint
pub async fn register_preview(
    State(state): State<ServerState>,
    ApiJson(body): ApiJson<RegisterPreviewRequest>,
) -> ApiResult<PreviewStatus> {
    let target = state.registry().register(
        &body.sandbox_id,
        body.port,
        &body.backend_url,
        body.metadata,
    );

    Ok(Json(PreviewStatus::from(target)))
}

/// Handler for the GET /preview/list endpoint
pub async fn list_previews(State(state): State<ServerState>) -> Json<BTreeMap<String, PreviewStatus>> {
    Json(
        state
            .registry()
            .list_targets()
            .into_iter()
            .map(|(key, target)| (key, PreviewStatus::from(target)))
            .collect(),
    )
}

/// Handler for ANY /preview/{sandbox_id}/{port}/{*path}
pub async fn proxy_preview(
    State(state): State<ServerState>,
    Path((sandbox_id, port, path)): Path<(String, u16, String)>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> SandcoreResult<Response> {
    let request = ProxyRequest {
        method,
        headers,
        query,
        body,
    };

    state
        .router()
        .route(&sandbox_id, port, &path, request)
        .await
}

/// Handler for ANY /preview/{sandbox_id}/{port} and its trailing-slash form
pub async fn proxy_preview_root(
    State(state): State<ServerState>,
    Path((sandbox_id, port)): Path<(String, u16)>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> SandcoreResult<Response> {
    let request = ProxyRequest {
        method,
        headers,
        query,
        body,
    };

    state.router().route(&sandbox_id, port, "", request).await
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn ensure_sandbox(state: &ServerState, sandbox_id: &str) -> SandcoreResult<()> {
    if state.manager().contains(sandbox_id).await {
        Ok(())
    } else {
        Err(SandcoreError::SandboxNotFound(sandbox_id.to_string()))
    }
}

/// Parses an optional JSON body. An empty body yields the default value.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> SandcoreResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }

    serde_json::from_slice(body)
        .map_err(|e| SandcoreError::InvalidArgument(format!("invalid request body: {e}")))
}

fn seconds(value: f64) -> SandcoreResult<Duration> {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|duration| !duration.is_zero())
        .ok_or_else(|| SandcoreError::InvalidArgument(format!("invalid duration in seconds: {value}")))
}
