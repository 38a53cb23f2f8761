//! Single shared basic-auth credential, checked at the HTTP boundary.
//!
//! Authentication is enforced only when both username and password are
//! configured.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::core::config::ServerConfig;

#[derive(Clone)]
pub struct BasicAuth {
    /// Precomputed `Basic <base64(user:pass)>` header value.
    expected: Option<Arc<str>>,
}

impl BasicAuth {
    pub fn from_config(config: &ServerConfig) -> Self {
        let expected = if config.basic_auth_username.is_empty()
            || config.basic_auth_password.is_empty()
        {
            None
        } else {
            let credential = format!(
                "{}:{}",
                config.basic_auth_username, config.basic_auth_password
            );
            Some(Arc::from(
                format!("Basic {}", BASE64.encode(credential)).as_str(),
            ))
        };
        Self { expected }
    }

    pub fn is_enabled(&self) -> bool {
        self.expected.is_some()
    }
}

pub async fn basic_auth_middleware(
    State(auth): State<BasicAuth>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &auth.expected {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == expected.as_ref());

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                [(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Basic realm=Restricted"),
                )],
            )
                .into_response();
        }
    }

    next.run(request).await
}
