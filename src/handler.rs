//! Verb-dispatched request handling.
//!
//! | Verb   | Success                                         |
//! |--------|-------------------------------------------------|
//! | GET    | 200, the JSON value at the path                 |
//! | PUT    | 200, `{"success":"value written"}` + `Location` |
//! | DELETE | 200, `{"success":"value deleted"}`              |
//! | other  | 405 with `Accepts: GET,PUT,DELETE`              |
//!
//! Failures map through [`StoreError`]: 404 for paths that do not resolve,
//! 400 for bad bodies or writes without a key, 500 for everything the store
//! itself got wrong.

use axum::http::header::{HeaderValue, ALLOW, LOCATION};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::coordinator::TreeStore;
use crate::error::StoreError;
use crate::path::display_path;

/// Verbs with an operation, as advertised on 405 responses.
pub const ACCEPTED_METHODS: &str = "GET,PUT,DELETE";

/// Header carrying [`ACCEPTED_METHODS`].
pub const ACCEPTS: &str = "accepts";

/// A decoded request, as handed over by the dispatch layer.
#[derive(Debug, Clone)]
pub struct StoreRequest<'a> {
    /// The HTTP verb.
    pub method: &'a Method,
    /// Decoded path segments.
    pub path: &'a [String],
    /// Absolute URL of the request, echoed in `Location` after writes.
    pub location: &'a str,
    /// Raw request body.
    pub body: &'a [u8],
}

/// Run one request against the store.
pub async fn handle(store: &TreeStore, request: StoreRequest<'_>) -> Response {
    let response = match *request.method {
        Method::GET => store.get(request.path).await.map(|value| Json(value).into_response()),
        Method::PUT => put(store, &request).await,
        Method::DELETE => store.delete(request.path).await.map(|_| {
            Json(json!({"success": "value deleted"})).into_response()
        }),
        _ => Err(StoreError::MethodNotAllowed(request.method.to_string())),
    };

    match response {
        Ok(response) => {
            debug!("{} {} -> {}", request.method, display_path(request.path), response.status());
            response
        }
        Err(e) => {
            if e.is_client_error() {
                debug!("{} {} rejected: {}", request.method, display_path(request.path), e);
            } else {
                warn!("{} {} failed: {}", request.method, display_path(request.path), e);
            }
            e.into_response()
        }
    }
}

async fn put(store: &TreeStore, request: &StoreRequest<'_>) -> Result<Response, StoreError> {
    if request.path.is_empty() {
        return Err(StoreError::BadRequest(
            "cannot write the document root; address a key".to_string(),
        ));
    }

    let value: Value = serde_json::from_slice(request.body).map_err(|e| {
        StoreError::BadRequest(format!("could not deserialize request body: {}", e))
    })?;

    store.put(request.path, value).await?;

    let mut response = Json(json!({"success": "value written"})).into_response();
    if let Ok(location) = HeaderValue::from_str(request.location) {
        response.headers_mut().insert(LOCATION, location);
    }
    Ok(response)
}

impl StoreError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::BadRequest(_) => StatusCode::BAD_REQUEST,
            StoreError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, self.to_string()).into_response();
        if status == StatusCode::METHOD_NOT_ALLOWED {
            let accepted = HeaderValue::from_static(ACCEPTED_METHODS);
            response.headers_mut().insert(ACCEPTS, accepted.clone());
            response.headers_mut().insert(ALLOW, accepted);
        }
        response
    }
}
