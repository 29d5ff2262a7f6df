//! HTTP dispatch layer.
//!
//! Every request, whatever its path, lands in one fallback handler that
//! decodes the path into segments, rebuilds the request URL for `Location`,
//! and passes the rest to [`handler::handle`](crate::handler::handle).
//! hyper runs each connection on its own task.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::HOST;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::future::Future;
use tokio::net::TcpListener;
use tracing::info;

use crate::coordinator::TreeStore;
use crate::error::Result;
use crate::handler::{handle, StoreRequest};
use crate::path::parse_path;

/// Build the router serving `store`.
pub fn router(store: TreeStore) -> Router {
    Router::new().fallback(dispatch).with_state(store)
}

async fn dispatch(
    State(store): State<TreeStore>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = match parse_path(uri.path()) {
        Ok(path) => path,
        Err(e) => return e.into_response(),
    };
    let location = request_url(&headers, &uri);

    handle(
        &store,
        StoreRequest {
            method: &method,
            path: &path,
            location: &location,
            body: &body,
        },
    )
    .await
}

/// Absolute URL of the request, falling back to the bare path without a Host.
fn request_url(headers: &HeaderMap, uri: &Uri) -> String {
    match headers.get(HOST).and_then(|h| h.to_str().ok()) {
        Some(host) => format!("http://{}{}", host, uri.path()),
        None => uri.path().to_string(),
    }
}

/// Serve `store` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    store: TreeStore,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Server stopped");
    Ok(())
}
