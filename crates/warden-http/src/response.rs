//! Response abstraction mutated by the security pipeline

use axum::{
    body::Body,
    response::{IntoResponse, Response},
};
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::error::{HttpError, HttpResult};

/// Response body types
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Json(serde_json::Value),
}

/// Mutable response populated by the pipeline and the application handler
#[derive(Debug, Clone)]
pub struct WardenResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
}

impl WardenResponse {
    /// Create new response with OK status
    pub fn new() -> Self {
        Self::with_status(StatusCode::OK)
    }

    /// Create response with specific status code
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    /// Get header value as string
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.to_str().ok())
    }

    /// Add header to response, replacing any existing value
    pub fn add_header<K, V>(&mut self, key: K, value: V) -> HttpResult<()>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let name = HeaderName::from_bytes(key.as_ref().as_bytes()).map_err(|_| {
            HttpError::InvalidHeaderName {
                name: key.as_ref().to_string(),
            }
        })?;
        let value = HeaderValue::from_str(value.as_ref()).map_err(|_| {
            HttpError::InvalidHeaderValue {
                name: key.as_ref().to_string(),
            }
        })?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Set a JSON body and the matching Content-Type
    pub fn set_json_value(&mut self, value: serde_json::Value) {
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = ResponseBody::Json(value);
    }

    /// Return the JSON body, if one was set
    pub fn json_body(&self) -> Option<&serde_json::Value> {
        match &self.body {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl Default for WardenResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl IntoResponse for WardenResponse {
    fn into_response(self) -> Response {
        let body = match self.body {
            ResponseBody::Empty => Body::empty(),
            ResponseBody::Json(value) => match serde_json::to_vec(&value) {
                Ok(bytes) => Body::from(bytes),
                Err(e) => {
                    tracing::error!("Failed to serialize JSON response body: {}", e);
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            },
        };

        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        response.headers_mut().extend(self.headers);
        response
    }
}
