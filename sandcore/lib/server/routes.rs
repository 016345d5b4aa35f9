//! Route definitions for the HTTP server.

use axum::{
    routing::{any, delete, get, post},
    Router,
};

use super::{handlers, state::ServerState};

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Creates a new router with all API endpoints configured
///
/// ## Arguments
/// * `state` - The shared server state
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route(
            "/sandboxes",
            get(handlers::list_sandboxes).post(handlers::create_sandbox),
        )
        .route(
            "/sandboxes/{sandbox_id}",
            get(handlers::get_sandbox).delete(handlers::delete_sandbox),
        )
        .route("/sandboxes/{sandbox_id}/exec", post(handlers::exec_command))
        .route(
            "/sandboxes/{sandbox_id}/files",
            get(handlers::list_files).post(handlers::write_file),
        )
        .route(
            "/sandboxes/{sandbox_id}/files/{*path}",
            get(handlers::read_file),
        )
        .route(
            "/sandboxes/{sandbox_id}/preview",
            post(handlers::expose_preview),
        )
        .route(
            "/sandboxes/{sandbox_id}/keepalive",
            post(handlers::keep_alive),
        )
        .route("/sandboxes/{sandbox_id}/mount", post(handlers::mount))
        .route(
            "/sandboxes/{sandbox_id}/background",
            post(handlers::start_background),
        )
        .route(
            "/sandboxes/{sandbox_id}/background/{job_id}",
            delete(handlers::stop_background),
        )
        .route(
            "/sandboxes/{sandbox_id}/snapshots",
            get(handlers::list_snapshots).post(handlers::create_snapshot),
        )
        .route(
            "/sandboxes/{sandbox_id}/snapshots/{snapshot_id}",
            delete(handlers::delete_snapshot),
        )
        .route(
            "/sandboxes/{sandbox_id}/snapshots/{snapshot_id}/restore",
            post(handlers::restore_snapshot),
        )
        .route("/sandboxes/{sandbox_id}/usage", get(handlers::sandbox_usage))
        .route("/usage", get(handlers::total_usage))
        .route("/fallback", get(handlers::list_fallbacks))
        .route("/preview/register", post(handlers::register_preview))
        .route("/preview/list", get(handlers::list_previews))
        .route(
            "/preview/{sandbox_id}/{port}",
            any(handlers::proxy_preview_root),
        )
        .route(
            "/preview/{sandbox_id}/{port}/",
            any(handlers::proxy_preview_root),
        )
        .route(
            "/preview/{sandbox_id}/{port}/{*path}",
            any(handlers::proxy_preview),
        )
        .with_state(state)
}
