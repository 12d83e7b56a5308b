use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::AnalyticsError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Maps analytics errors onto HTTP responses
#[derive(Debug)]
pub struct ApiError(pub AnalyticsError);

impl From<AnalyticsError> for ApiError {
    fn from(e: AnalyticsError) -> Self {
        Self(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(AnalyticsError::Storage(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AnalyticsError::Validation(_) => StatusCode::BAD_REQUEST,
            AnalyticsError::NotFound(_) => StatusCode::NOT_FOUND,
            AnalyticsError::Forbidden(_) => StatusCode::FORBIDDEN,
            AnalyticsError::Storage(e) => {
                tracing::error!(error = %e, "Storage failure while serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let error = match &self.0 {
            AnalyticsError::Storage(_) => "internal storage error".to_string(),
            other => other.to_string(),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AnalyticsError::validation("bad"), StatusCode::BAD_REQUEST),
            (AnalyticsError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (AnalyticsError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (
                AnalyticsError::Storage(anyhow::anyhow!("disk")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError(error).into_response().status(), status);
        }
    }
}
