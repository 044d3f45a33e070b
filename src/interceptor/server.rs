//! Local origin with the interception layer in front
//!
//! Every request reaching the origin passes through [`intercept`]. Requests
//! the interceptor answers never reach the inner service; declined requests
//! are handed to it untouched (the page's own static files, or a plain 404).

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use super::{DeclineReason, Resolution};
use crate::lifecycle::Registry;

/// Interception layer.
///
/// Until an interceptor is active in the registry, every request falls
/// through.
pub async fn intercept(
    State(registry): State<Arc<Registry>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(interceptor) = registry.active() else {
        return next.run(request).await;
    };

    let path = request.uri().path().to_string();
    match interceptor.resolve(&path).await {
        Resolution::Intercepted(bytes) => Response::new(Body::from(bytes)),
        Resolution::Declined(reason) => {
            if reason == DeclineReason::NotInArchive {
                debug!("Virtual resource not in archive, passing through: {}", path);
            }
            next.run(request).await
        }
        Resolution::Error(e) => {
            warn!("Interception failed for {}: {}", path, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Build the origin: optional static directory, wrapped by the interception layer
pub fn router(registry: Arc<Registry>, static_dir: Option<PathBuf>) -> Router {
    let inner = match static_dir {
        Some(dir) => Router::new().fallback_service(ServeDir::new(dir)),
        None => Router::new().fallback(not_found),
    };
    inner.layer(middleware::from_fn_with_state(registry, intercept))
}

/// Bind the origin and serve it in the background
pub async fn serve(
    addr: SocketAddr,
    registry: Arc<Registry>,
    static_dir: Option<PathBuf>,
) -> Result<SocketAddr> {
    let app = router(registry, static_dir);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener
        .local_addr()
        .context("Failed to read bound address")?;

    info!("Preview origin listening on http://{}", local_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Preview origin stopped: {}", e);
        }
    });

    Ok(local_addr)
}
