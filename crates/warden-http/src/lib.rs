//! # warden-http
//!
//! The request/response model handed to the warden security pipeline.
//! A server decodes a raw request into a [`WardenRequest`], the pipeline mutates a
//! [`WardenResponse`], and the server turns that response back into an axum response.

pub mod error;
pub mod request;
pub mod response;

pub use error::{HttpError, HttpResult};
pub use request::WardenRequest;
pub use response::{ResponseBody, WardenResponse};

// Re-export the http primitives used across the public API
pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
