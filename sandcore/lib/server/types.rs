//! Request and response bodies of the REST API.

use std::{collections::BTreeMap, path::PathBuf};

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{preview::PreviewTarget, ErrorKind, SandcoreError};

//--------------------------------------------------------------------------------------------------
// Types: Requests
//--------------------------------------------------------------------------------------------------

/// A JSON request body whose rejections render as an [`ErrorResponse`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

/// Request body for creating a sandbox.
#[derive(Debug, Default, Deserialize)]
pub struct CreateSandboxRequest {
    /// The id to use. One is generated when absent.
    pub sandbox_id: Option<String>,
}

/// Request body for running a command.
#[derive(Debug, Deserialize)]
pub struct ExecBody {
    /// The command, `python` or `node` to run locally.
    pub command: String,

    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Source code to run.
    pub code: Option<String>,

    /// Timeout in seconds.
    pub timeout: Option<f64>,

    /// Forces delegation to the fallback container.
    #[serde(default)]
    pub requires_native: bool,
}

/// Request body for writing a file.
#[derive(Debug, Deserialize)]
pub struct WriteFileRequest {
    /// Virtual path of the file.
    pub path: String,

    /// File contents.
    pub data: String,
}

/// Query parameters for listing a directory.
#[derive(Debug, Default, Deserialize)]
pub struct ListFilesQuery {
    /// Virtual path of the directory. The workspace root when absent.
    #[serde(default)]
    pub path: String,
}

/// Request body for exposing a preview port.
#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    /// The port the sandbox listens on.
    pub port: u16,
}

/// Request body for mounting a host directory.
#[derive(Debug, Deserialize)]
pub struct MountRequest {
    /// Name of the mount inside the sandbox.
    pub alias: String,

    /// Host directory to mount.
    pub target: PathBuf,
}

/// Request body for starting a background job.
#[derive(Debug, Deserialize)]
pub struct BackgroundRequest {
    /// The command run on each tick.
    pub command: String,

    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Seconds between runs.
    pub interval: f64,
}

/// Request body for taking a snapshot.
#[derive(Debug, Default, Deserialize)]
pub struct SnapshotRequest {
    /// The snapshot id. A timestamped one is generated when absent.
    pub snapshot_id: Option<String>,
}

/// Request body for registering a preview target directly with the router.
#[derive(Debug, Deserialize)]
pub struct RegisterPreviewRequest {
    /// The sandbox.
    pub sandbox_id: String,

    /// The preview port.
    pub port: u16,

    /// The primary upstream.
    pub backend_url: String,

    /// Free-form labels.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Types: Responses
//--------------------------------------------------------------------------------------------------

/// Response for a created sandbox.
#[derive(Debug, Serialize)]
pub struct CreateSandboxResponse {
    /// The sandbox id.
    pub sandbox_id: String,

    /// The workspace directory.
    pub workspace: PathBuf,
}

/// Response for operations that only report success.
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    /// Always true.
    pub success: bool,
}

/// Response for a directory listing.
#[derive(Debug, Serialize)]
pub struct EntriesResponse {
    /// Virtual paths of the entries.
    pub entries: Vec<String>,
}

/// Response for a file read.
#[derive(Debug, Serialize)]
pub struct ContentResponse {
    /// The file contents, lossily decoded as UTF-8.
    pub content: String,
}

/// Response carrying a URL.
#[derive(Debug, Serialize)]
pub struct UrlResponse {
    /// The URL.
    pub url: String,
}

/// Response carrying a status string.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// The status.
    pub status: String,
}

/// Response for a started background job.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    /// The job id.
    pub job_id: String,
}

/// Response for a stopped background job.
#[derive(Debug, Serialize)]
pub struct StoppedResponse {
    /// Always true.
    pub stopped: bool,
}

/// Response for a deleted resource.
#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    /// Always true.
    pub deleted: bool,
}

/// Response for a restored snapshot.
#[derive(Debug, Serialize)]
pub struct RestoredResponse {
    /// Always true.
    pub restored: bool,
}

/// The public view of a preview target.
#[derive(Debug, Serialize)]
pub struct PreviewStatus {
    /// The sandbox.
    pub sandbox_id: String,

    /// The preview port.
    pub port: u16,

    /// The effective upstream URL.
    pub url: String,

    /// Whether the target is on fallback.
    pub use_fallback: bool,

    /// Free-form labels.
    pub metadata: BTreeMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Types: Error Response
//--------------------------------------------------------------------------------------------------

/// Standard error response format
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// HTTP status code
    pub code: u16,

    /// Error message
    pub message: String,

    /// Error type for categorizing errors
    pub error_type: ErrorType,

    /// Optional additional details about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Types of errors that can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Invalid request parameters or body
    ValidationError,

    /// Resource not found
    NotFound,

    /// The operation is not permitted
    PermissionDenied,

    /// The resource already exists
    Conflict,

    /// A capacity limit was hit
    ResourceExhausted,

    /// A preview upstream could not be reached
    UpstreamError,

    /// Internal server errors
    InternalError,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: u16, message: String, error_type: ErrorType) -> Self {
        Self {
            code,
            message,
            error_type,
            details: None,
        }
    }

    /// Add details to the error response, ignoring details for 500-level errors
    pub fn with_details(mut self, details: String) -> Self {
        if self.code < 500 {
            self.details = Some(details);
        }
        self
    }
}

impl StatusResponse {
    /// The `{"status": "ok"}` response.
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<PreviewTarget> for PreviewStatus {
    fn from(target: PreviewTarget) -> Self {
        Self {
            url: target.effective_url().to_string(),
            sandbox_id: target.sandbox_id,
            port: target.port,
            use_fallback: target.use_fallback,
            metadata: target.metadata,
        }
    }
}

impl From<ErrorKind> for ErrorType {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::InvalidInput => Self::ValidationError,
            ErrorKind::PermissionDenied => Self::PermissionDenied,
            ErrorKind::Conflict => Self::Conflict,
            ErrorKind::ResourceExhausted => Self::ResourceExhausted,
            ErrorKind::UpstreamUnavailable => Self::UpstreamError,
            ErrorKind::Internal => Self::InternalError,
        }
    }
}

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = SandcoreError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

impl From<JsonRejection> for SandcoreError {
    fn from(rejection: JsonRejection) -> Self {
        SandcoreError::InvalidArgument(rejection.body_text())
    }
}

impl IntoResponse for SandcoreError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if kind == ErrorKind::Internal {
            tracing::error!(error = %self, "request failed");
        }

        let message = match kind {
            ErrorKind::NotFound => "Resource not found",
            ErrorKind::InvalidInput => "Invalid request",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Conflict => "Resource already exists",
            ErrorKind::ResourceExhausted => "Capacity exhausted",
            ErrorKind::UpstreamUnavailable => "Upstream unavailable",
            ErrorKind::Internal => "Internal server error",
        };

        let body = ErrorResponse::new(status.as_u16(), message.to_string(), kind.into())
            .with_details(self.to_string());

        (status, Json(body)).into_response()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (SandcoreError::SandboxNotFound("x".into()), StatusCode::NOT_FOUND),
            (SandcoreError::InvalidPath("..".into()), StatusCode::BAD_REQUEST),
            (SandcoreError::PermissionDenied("/etc".into()), StatusCode::FORBIDDEN),
            (SandcoreError::SandboxAlreadyExists("x".into()), StatusCode::CONFLICT),
            (SandcoreError::SandboxLimitReached(1), StatusCode::SERVICE_UNAVAILABLE),
            (SandcoreError::UpstreamUnavailable("refused".into()), StatusCode::BAD_GATEWAY),
            (
                SandcoreError::custom(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn test_json_rejection_is_structured() -> anyhow::Result<()> {
        let request = Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(axum::body::Body::from("{\"command\": 42"))?;

        let Err(error) = ApiJson::<ExecBody>::from_request(request, &()).await else {
            anyhow::bail!("malformed body was accepted");
        };
        assert!(matches!(error, SandcoreError::InvalidArgument(_)));

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let body: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(body["code"], 400);
        assert!(body["message"].is_string());

        let request = Request::builder()
            .method("POST")
            .body(axum::body::Body::from("{}"))?;
        assert!(matches!(
            ApiJson::<ExecBody>::from_request(request, &()).await,
            Err(SandcoreError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_error_response_details() {
        let response = ErrorResponse::new(404, "missing".into(), ErrorType::NotFound)
            .with_details("sandbox sb1".into());
        assert_eq!(response.details.as_deref(), Some("sandbox sb1"));

        let response = ErrorResponse::new(500, "internal".into(), ErrorType::InternalError)
            .with_details("stack".into());
        assert!(response.details.is_none());
    }
}
