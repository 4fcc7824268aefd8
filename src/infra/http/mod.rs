pub mod api;
mod middleware;

pub use api::rate_limit::{ApiRateLimiter, RateDecision};
pub use api::{ApiState, build_router};
pub use middleware::RequestContext;

use axum::http::StatusCode;

use crate::application::repos::RepoError;
use crate::application::timestamps::TimestampServiceError;

use api::error::{ApiError, codes};

/// Map a service failure to the API error surface.
///
/// Store failures become 503 without leaking driver detail to the caller;
/// the detail travels in the attached report for the response logger.
pub fn service_error_to_api(err: TimestampServiceError) -> ApiError {
    match err {
        TimestampServiceError::InvalidInput(message) => {
            ApiError::bad_request("Invalid input", Some(message))
        }
        TimestampServiceError::NotFound => ApiError::not_found("Timestamp not found"),
        TimestampServiceError::Store(err) => store_error_to_api(err),
    }
}

fn store_error_to_api(err: RepoError) -> ApiError {
    let diagnostic = err.to_string();
    let code = match err {
        RepoError::Timeout => codes::DB_TIMEOUT,
        _ => codes::STORE_UNAVAILABLE,
    };
    ApiError::new(
        StatusCode::SERVICE_UNAVAILABLE,
        code,
        "Timestamp store unavailable",
        None,
    )
    .with_diagnostic(diagnostic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn service_errors_map_to_documented_statuses() {
        let cases = [
            (
                TimestampServiceError::InvalidInput("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (TimestampServiceError::NotFound, StatusCode::NOT_FOUND),
            (
                TimestampServiceError::Store(RepoError::Timeout),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                TimestampServiceError::Store(RepoError::Persistence("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(service_error_to_api(err).into_response().status(), status);
        }
    }
}
