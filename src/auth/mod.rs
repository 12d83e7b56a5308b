//! Caller identity from the upstream auth gateway
//!
//! Tokens are verified before requests reach this service; the gateway
//! forwards the authenticated user id in `X-User-Id`.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::api::error::ErrorResponse;

pub const USER_ID_HEADER: &str = "X-User-Id";

/// Authenticated user id, inserted into request extensions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub String);

impl Caller {
    pub fn id(&self) -> &str {
        &self.0
    }
}

pub async fn require_caller(mut request: Request, next: Next) -> Response {
    let user_id = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    match user_id {
        Some(user_id) => {
            request.extensions_mut().insert(Caller(user_id));
            next.run(request).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: format!("missing {USER_ID_HEADER} header"),
            }),
        )
            .into_response(),
    }
}
