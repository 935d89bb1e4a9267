//! Security middleware implementations

pub mod csrf;
pub mod rate_limit;
pub mod security_headers;
mod sweeper;

pub use csrf::{CsrfGuard, CsrfRejection};
pub use rate_limit::{ClientLimitState, RateLimitDecision, RateLimiter};
pub use security_headers::HeaderPolicy;

use http::StatusCode;
use serde_json::json;
use warden_http::WardenResponse;

/// Populate `response` with the stable `{"success": false, "error": ...}` denial shape
pub(crate) fn write_denial(response: &mut WardenResponse, status: StatusCode, message: &str) {
    response.set_status(status);
    response.set_json_value(json!({
        "success": false,
        "error": message,
    }));
}
