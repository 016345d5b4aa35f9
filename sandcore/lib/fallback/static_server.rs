//! The built-in static file server used as the default fallback server.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    extract::{Request, State},
    http::{header, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    Router,
};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use sandutils::virtual_components;
use tokio::{fs, net::TcpListener};
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};

use crate::{server::shutdown_signal, SandcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Characters escaped in listing links. `/` is kept so directory entries stay navigable.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Serves the files under `root` on `addr` until SIGINT or SIGTERM.
///
/// Directories are answered with their `index.html` when present, otherwise with a listing.
/// `OPTIONS` is always answered with 200 so health probes succeed.
pub async fn serve_static(root: PathBuf, addr: SocketAddr) -> SandcoreResult<()> {
    let root = fs::canonicalize(&root).await?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, root = %root.display(), "serving static files");

    let app = Router::new()
        .fallback(handle_request)
        .with_state(Arc::new(root));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn handle_request(State(root): State<Arc<PathBuf>>, request: Request) -> Response {
    let method = request.method().clone();
    if method == Method::OPTIONS {
        return (StatusCode::OK, [(header::ALLOW, "GET, HEAD, OPTIONS")]).into_response();
    }

    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let components = match percent_decode_str(request.uri().path()).decode_utf8() {
        Ok(path) => virtual_components(&path),
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let Ok(components) = components else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let target = components
        .iter()
        .fold(root.as_ref().clone(), |path, part| path.join(part));

    // Symlinks may point anywhere; only serve what lands under the root.
    let Ok(target) = fs::canonicalize(&target).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if !target.starts_with(root.as_ref()) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let is_dir = fs::metadata(&target)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);

    if !is_dir {
        return ServeDir::new(root.as_ref()).oneshot(request).await.into_response();
    }

    let index = target.join("index.html");
    if fs::try_exists(&index).await.unwrap_or(false) {
        return ServeFile::new(index).oneshot(request).await.into_response();
    }

    list_directory(target, &components).await
}

async fn list_directory(path: PathBuf, components: &[String]) -> Response {
    let mut entries = match fs::read_dir(&path).await {
        Ok(entries) => entries,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    let base = if components.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", components.join("/"))
    };

    let items: String = names
        .iter()
        .map(|name| {
            let href = utf8_percent_encode(name, PATH_SEGMENT);
            let name = escape_html(name);
            format!("<li><a href=\"{href}\">{name}</a></li>\n")
        })
        .collect();

    Html(format!(
        "<!DOCTYPE html>\n<html><head><title>Directory listing for {base}</title></head>\n<body><h1>Directory listing for {base}</h1>\n<ul>\n{items}</ul></body></html>\n",
        base = escape_html(&base)
    ))
    .into_response()
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
