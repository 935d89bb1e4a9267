//! HTTP model error types

use thiserror::Error;

/// Result type for HTTP model operations
pub type HttpResult<T> = Result<T, HttpError>;

/// Errors raised while building or converting requests and responses
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Invalid header name: {name}")]
    InvalidHeaderName { name: String },

    #[error("Invalid header value for {name}")]
    InvalidHeaderValue { name: String },
}
