//! Credential middleware for the scrape endpoint
//!
//! Clients authenticate with `X-Server-Name` / `X-Password` headers,
//! checked against the configured credential map before the WebSocket
//! upgrade. Mismatch or absence yields 401 and never reaches the socket.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Header naming the connecting client.
pub const SERVER_NAME_HEADER: &str = "x-server-name";
/// Header carrying the client's password.
pub const PASSWORD_HEADER: &str = "x-password";

/// Shared credential map.
#[derive(Clone)]
pub struct AuthState {
    credentials: Arc<HashMap<String, String>>,
}

impl AuthState {
    pub fn new(credentials: HashMap<String, String>) -> Self {
        Self {
            credentials: Arc::new(credentials),
        }
    }

    /// Validate a name/password pair.
    pub fn validate(&self, name: &str, password: &str) -> bool {
        self.credentials
            .get(name)
            .map(|expected| expected == password)
            .unwrap_or(false)
    }
}

/// Reject requests without a valid credential pair.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let headers = request.headers();
    let name = headers
        .get(SERVER_NAME_HEADER)
        .and_then(|v| v.to_str().ok());
    let password = headers.get(PASSWORD_HEADER).and_then(|v| v.to_str().ok());

    match (name, password) {
        (Some(name), Some(password)) if auth.validate(name, password) => {
            next.run(request).await
        }
        (name, _) => {
            warn!(client = ?name, "rejected unauthenticated request");
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}
