//! Request abstraction handed to the security pipeline
//!
//! Carries the already-parsed parts of an HTTP request: method, URI, headers, the
//! remote peer, and the query/form parameter maps.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::body::Bytes;
use http::{request::Parts, HeaderMap, Method, Uri};

use crate::error::{HttpError, HttpResult};

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Parsed request as seen by the security pipeline
#[derive(Debug, Clone)]
pub struct WardenRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
    pub query_params: HashMap<String, String>,
    pub form_params: HashMap<String, String>,
    secure: bool,
}

impl WardenRequest {
    /// Create a request from its method, URI and headers. Query parameters are
    /// parsed from the URI.
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        let query_params = uri.query().map(parse_pairs).unwrap_or_default();
        Self {
            method,
            uri,
            headers,
            remote_addr: None,
            query_params,
            form_params: HashMap::new(),
            secure: false,
        }
    }

    /// Build from `http` request parts and the buffered body
    pub fn from_parts(parts: &Parts, body: &[u8]) -> Self {
        let mut request = Self::new(parts.method.clone(), parts.uri.clone(), parts.headers.clone());
        if parts.uri.scheme_str() == Some("https") {
            request.secure = true;
        }
        request.set_body(body);
        request
    }

    /// Set the remote peer address (consuming)
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Mark whether the request arrived over an encrypted transport (consuming)
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Attach a body (consuming). Form fields are only parsed for
    /// `application/x-www-form-urlencoded` requests.
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.set_body(&body);
        self
    }

    /// Attach a body (borrowing - for middleware use)
    pub fn set_body(&mut self, body: &[u8]) {
        if !self.is_form_urlencoded() || body.is_empty() {
            return;
        }
        match std::str::from_utf8(body) {
            Ok(text) => self.form_params.extend(parse_pairs(text)),
            Err(_) => tracing::debug!("Ignoring non UTF-8 form body"),
        }
    }

    /// Add header to request (for middleware and test use)
    pub fn add_header<K, V>(&mut self, key: K, value: V) -> HttpResult<()>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let name = http::HeaderName::from_bytes(key.as_ref().as_bytes()).map_err(|_| {
            HttpError::InvalidHeaderName {
                name: key.as_ref().to_string(),
            }
        })?;
        let value = http::HeaderValue::from_str(value.as_ref()).map_err(|_| {
            HttpError::InvalidHeaderValue {
                name: key.as_ref().to_string(),
            }
        })?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Add query parameter (for middleware use)
    pub fn add_query_param<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.query_params.insert(key.into(), value.into());
    }

    /// Add form parameter (for middleware use)
    pub fn add_form_param<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.form_params.insert(key.into(), value.into());
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn method_str(&self) -> &str {
        self.method.as_str()
    }

    /// Get header value as a string slice, ignoring non-visible-ASCII values
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Get Content-Type header
    pub fn content_type(&self) -> Option<&str> {
        self.header_str("content-type")
    }

    /// Check if the body is `application/x-www-form-urlencoded`
    pub fn is_form_urlencoded(&self) -> bool {
        self.content_type()
            .and_then(|ct| ct.split(';').next())
            .map(|media| media.trim().eq_ignore_ascii_case(FORM_URLENCODED))
            .unwrap_or(false)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(String::as_str)
    }

    pub fn form_param(&self, name: &str) -> Option<&str> {
        self.form_params.get(name).map(String::as_str)
    }

    /// Resolve a request parameter, query string first, then form body
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query_param(name).or_else(|| self.form_param(name))
    }

    /// Whether the request is known to have arrived over TLS
    pub fn is_secure(&self) -> bool {
        self.secure
    }
}

fn parse_pairs(input: &str) -> HashMap<String, String> {
    match serde_urlencoded::from_str::<Vec<(String, String)>>(input) {
        Ok(pairs) => pairs.into_iter().collect(),
        Err(e) => {
            tracing::debug!("Failed to parse urlencoded parameters: {}", e);
            HashMap::new()
        }
    }
}
