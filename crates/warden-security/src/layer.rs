//! axum integration
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/orders", post(create_order))
//!     .layer(axum::middleware::from_fn_with_state(pipeline, security_middleware));
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use http_body_util::LengthLimitError;
use warden_http::{WardenRequest, WardenResponse};

use crate::pipeline::SecurityPipeline;

/// Largest form body buffered for the CSRF form-field fallback
pub const MAX_FORM_BODY_BYTES: usize = 1024 * 1024;

/// Run the security pipeline in front of the wrapped handler.
///
/// Denials are returned directly; allowed requests continue to `next` and the
/// policy headers are copied onto the handler's response.
pub async fn security_middleware(
    State(pipeline): State<Arc<SecurityPipeline>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();

    let mut warden_request = WardenRequest::from_parts(&parts, &[]);
    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        warden_request = warden_request.with_remote_addr(*addr);
    }

    // Only form bodies are buffered; everything else streams through untouched
    let body = if warden_request.is_form_urlencoded() {
        match to_bytes(body, MAX_FORM_BODY_BYTES).await {
            Ok(bytes) => {
                warden_request.set_body(&bytes);
                Body::from(bytes)
            }
            Err(e) => {
                let (status, message) = body_rejection(&e);
                tracing::warn!(status = status.as_u16(), "Rejecting unreadable form body: {}", e);
                let mut denial = WardenResponse::new();
                pipeline
                    .header_policy()
                    .apply_to(&mut denial, warden_request.is_secure());
                denial.set_status(status);
                denial.set_json_value(serde_json::json!({
                    "success": false,
                    "error": message,
                }));
                return denial.into_response();
            }
        }
    } else {
        body
    };

    let mut outcome = WardenResponse::new();
    if !pipeline.validate(&warden_request, &mut outcome) {
        return outcome.into_response();
    }

    let mut response = next.run(Request::from_parts(parts, body)).await;
    for (name, value) in outcome.headers() {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    response
}

/// Status and message for a form body that could not be buffered
fn body_rejection(error: &axum::Error) -> (StatusCode, &'static str) {
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        if cause.is::<LengthLimitError>() {
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large.");
        }
        source = cause.source();
    }
    (StatusCode::BAD_REQUEST, "Request body could not be read.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_length_limit_maps_to_payload_too_large() {
        let error = to_bytes(Body::from("abcdef"), 2).await.unwrap_err();

        assert_eq!(body_rejection(&error).0, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_stream_failure_maps_to_bad_request() {
        let error = axum::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "client went away",
        ));

        assert_eq!(
            body_rejection(&error),
            (StatusCode::BAD_REQUEST, "Request body could not be read.")
        );
    }
}
