pub mod manager;
pub mod room;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::Request,
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use sse_broker::Broker;
use tower::Service;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

/// Assembles the application router: the connection endpoints nested under
/// the broker's prefix, a liveness probe, and optionally the UI file tree.
pub fn build_router(broker: Arc<Broker>, ui_dir: Option<PathBuf>) -> Router {
    let prefix = broker.prefix().trim_matches('/').to_owned();
    let api = sse_broker::routes(broker);

    let router = Router::new().route("/healthz", get(healthz));
    let router = if prefix.is_empty() {
        router.merge(api)
    } else {
        router.nest(&format!("/{prefix}"), api)
    };

    let router = match ui_dir {
        Some(dir) => router.fallback(move |method: Method, uri: Uri, req: Request| {
            let prefix = prefix.clone();
            let dir = dir.clone();
            async move { ui_fallback(&prefix, method, &uri, req, dir).await }
        }),
        None => router,
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
}

fn is_reserved_backend_path(prefix: &str, path: &str) -> bool {
    let first_segment = path.trim_start_matches('/').split('/').next().unwrap_or("");
    let api_segment = prefix.split('/').next().unwrap_or("");
    first_segment == api_segment || first_segment == "healthz"
}

async fn ui_fallback(
    prefix: &str,
    method: Method,
    uri: &Uri,
    req: Request,
    ui_dir: PathBuf,
) -> Response {
    if is_reserved_backend_path(prefix, uri.path()) {
        return StatusCode::NOT_FOUND.into_response();
    }

    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let index = ui_dir.join("index.html");
    let mut service = ServeDir::new(ui_dir).fallback(ServeFile::new(index));
    match service.call(req).await {
        Ok(response) => response.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_paths_are_not_served_from_the_ui_tree() {
        assert!(is_reserved_backend_path("api", "/api/command"));
        assert!(is_reserved_backend_path("api", "/healthz"));
        assert!(!is_reserved_backend_path("api", "/index.html"));
        assert!(!is_reserved_backend_path("api", "/"));
    }
}
