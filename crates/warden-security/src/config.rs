//! Security configuration types and utilities
//!
//! Every section deserializes with `#[serde(default)]`, so a partial JSON document
//! (or none at all) yields the conservative built-in values.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::{SecurityError, SecurityResult};

/// Global security configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Rate limiting configuration
    pub rate_limiting: RateLimitConfig,

    /// CSRF protection configuration
    pub csrf: CsrfConfig,

    /// Security headers configuration
    pub security_headers: SecurityHeadersConfig,

    /// Whether the serving endpoint guarantees transport encryption.
    /// Strict-Transport-Security is only emitted when this is set or the
    /// request itself arrived over https.
    pub transport_encrypted: bool,
}

impl SecurityConfig {
    /// Parse configuration from a JSON document
    pub fn from_json_str(json: &str) -> SecurityResult<Self> {
        let config: SecurityConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> SecurityResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> SecurityResult<()> {
        self.rate_limiting.validate()?;
        self.csrf.validate()?;
        self.security_headers.validate()
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Soft limit: requests per window before warnings are logged
    pub max_requests: u32,

    /// Time window duration
    pub window_seconds: u64,

    /// Hard limit within a window; `None` means 1.5 × `max_requests`
    pub burst_limit: Option<u32>,

    /// How long a client stays blocked after exceeding the burst limit
    pub block_minutes: u64,

    /// Interval between background sweeps of idle clients
    pub sweep_interval_seconds: u64,

    /// Clients idle for longer than this many windows are evicted by the sweeper
    pub idle_multiplier: u32,

    /// Identifier strategy
    pub identifier: ClientIdentifier,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_seconds: 60,
            burst_limit: None,
            block_minutes: 5,
            sweep_interval_seconds: 300,
            idle_multiplier: 5,
            identifier: ClientIdentifier::RemoteAddress,
        }
    }
}

impl RateLimitConfig {
    /// Burst limit after applying the 1.5 × `max_requests` default
    pub fn effective_burst_limit(&self) -> u32 {
        self.burst_limit.unwrap_or_else(|| {
            let derived = u64::from(self.max_requests) * 3 / 2;
            u32::try_from(derived).unwrap_or(u32::MAX)
        })
    }

    pub fn window(&self) -> time::Duration {
        time::Duration::seconds(saturating_i64(self.window_seconds))
    }

    pub fn block_duration(&self) -> time::Duration {
        time::Duration::seconds(saturating_i64(self.retry_after_seconds()))
    }

    /// `Retry-After` value sent with every rate limit denial
    pub fn retry_after_seconds(&self) -> u64 {
        self.block_minutes.saturating_mul(60)
    }

    /// Idle span after which an unblocked client may be evicted
    pub fn idle_threshold(&self) -> time::Duration {
        time::Duration::seconds(saturating_i64(
            self.window_seconds
                .saturating_mul(u64::from(self.idle_multiplier)),
        ))
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn validate(&self) -> SecurityResult<()> {
        if self.max_requests == 0 {
            return Err(SecurityError::invalid_config(
                "rate_limiting.max_requests",
                "must be greater than 0",
            ));
        }
        if self.window_seconds == 0 || self.window_seconds > MAX_SPAN_SECONDS {
            return Err(SecurityError::invalid_config(
                "rate_limiting.window_seconds",
                format!("must be between 1 and {}", MAX_SPAN_SECONDS),
            ));
        }
        if self.effective_burst_limit() < self.max_requests {
            return Err(SecurityError::invalid_config(
                "rate_limiting.burst_limit",
                format!("must be at least max_requests ({})", self.max_requests),
            ));
        }
        if self.block_minutes == 0 || self.block_minutes > MAX_SPAN_SECONDS / 60 {
            return Err(SecurityError::invalid_config(
                "rate_limiting.block_minutes",
                format!("must be between 1 and {}", MAX_SPAN_SECONDS / 60),
            ));
        }
        if self.sweep_interval_seconds == 0 || self.sweep_interval_seconds > MAX_SPAN_SECONDS {
            return Err(SecurityError::invalid_config(
                "rate_limiting.sweep_interval_seconds",
                format!("must be between 1 and {}", MAX_SPAN_SECONDS),
            ));
        }
        if self.idle_multiplier == 0 {
            return Err(SecurityError::invalid_config(
                "rate_limiting.idle_multiplier",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Upper bound for windows, blocks and sweep intervals (one year)
const MAX_SPAN_SECONDS: u64 = 365 * 24 * 60 * 60;

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// How the rate limiter identifies a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientIdentifier {
    /// Use the socket peer address
    RemoteAddress,
    /// Trust `X-Forwarded-For` / `X-Real-IP` set by a reverse proxy, falling back
    /// to the socket peer address
    ForwardedFor,
}

/// CSRF (Cross-Site Request Forgery) protection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrfConfig {
    /// Request header carrying the token
    pub token_header: String,

    /// Form field checked when the body is form-url-encoded
    pub token_form_field: String,

    /// Session key the expected token is stored under
    pub token_session_key: String,

    /// HTTP methods subject to CSRF validation
    pub protected_methods: HashSet<String>,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            token_header: "X-CSRF-Token".to_string(),
            token_form_field: "__CSRFToken__".to_string(),
            token_session_key: "csrf_token".to_string(),
            protected_methods: ["POST", "PUT", "DELETE", "PATCH"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl CsrfConfig {
    pub fn validate(&self) -> SecurityResult<()> {
        if http::HeaderName::from_bytes(self.token_header.as_bytes()).is_err() {
            return Err(SecurityError::invalid_config(
                "csrf.token_header",
                format!("'{}' is not a valid header name", self.token_header),
            ));
        }
        if self.token_form_field.is_empty() {
            return Err(SecurityError::invalid_config(
                "csrf.token_form_field",
                "must not be empty",
            ));
        }
        if self.token_session_key.is_empty() {
            return Err(SecurityError::invalid_config(
                "csrf.token_session_key",
                "must not be empty",
            ));
        }
        if self.protected_methods.is_empty() {
            return Err(SecurityError::invalid_config(
                "csrf.protected_methods",
                "must name at least one method",
            ));
        }
        Ok(())
    }
}

/// Security headers configuration. An empty value disables that header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityHeadersConfig {
    pub content_security_policy: String,
    pub x_frame_options: String,
    pub x_xss_protection: String,
    pub strict_transport_security: String,
    pub x_content_type_options: String,
    pub referrer_policy: String,
    pub permissions_policy: String,
    pub x_download_options: String,
    pub x_dns_prefetch_control: String,
}

pub const STRICT_TRANSPORT_SECURITY: &str = "strict-transport-security";

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            content_security_policy: "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; img-src 'self' data:; font-src 'self'; object-src 'none'; frame-ancestors 'self'".to_string(),
            x_frame_options: "SAMEORIGIN".to_string(),
            x_xss_protection: "1; mode=block".to_string(),
            strict_transport_security: "max-age=31536000; includeSubDomains".to_string(),
            x_content_type_options: "nosniff".to_string(),
            referrer_policy: "strict-origin-when-cross-origin".to_string(),
            permissions_policy: "camera=(), microphone=(), geolocation=()".to_string(),
            x_download_options: "noopen".to_string(),
            x_dns_prefetch_control: "off".to_string(),
        }
    }
}

impl SecurityHeadersConfig {
    /// Strict production settings
    pub fn strict() -> Self {
        Self {
            content_security_policy: "default-src 'self'; script-src 'self'; style-src 'self'; img-src 'self' data: https:; font-src 'self'; connect-src 'self'; object-src 'none'; frame-ancestors 'none'; form-action 'self'; base-uri 'self'".to_string(),
            x_frame_options: "DENY".to_string(),
            strict_transport_security: "max-age=63072000; includeSubDomains; preload".to_string(),
            permissions_policy: "camera=(), microphone=(), geolocation=(), interest-cohort=()".to_string(),
            ..Self::default()
        }
    }

    /// Development-friendly settings
    pub fn development() -> Self {
        Self {
            content_security_policy: "default-src 'self' 'unsafe-inline' 'unsafe-eval'; img-src 'self' data: blob: https:; connect-src 'self' ws: wss: http: https:".to_string(),
            strict_transport_security: String::new(),
            referrer_policy: "origin-when-cross-origin".to_string(),
            x_dns_prefetch_control: "on".to_string(),
            ..Self::default()
        }
    }

    /// Settings for JSON APIs that never render documents
    pub fn api_focused() -> Self {
        Self {
            content_security_policy: "default-src 'none'; frame-ancestors 'none'".to_string(),
            x_frame_options: "DENY".to_string(),
            strict_transport_security: "max-age=63072000; includeSubDomains".to_string(),
            referrer_policy: "no-referrer".to_string(),
            permissions_policy: "camera=(), microphone=(), geolocation=(), payment=(), usb=()".to_string(),
            ..Self::default()
        }
    }

    /// All nine header slots as (lowercase header name, configured value)
    pub fn entries(&self) -> [(&'static str, &str); 9] {
        [
            ("content-security-policy", self.content_security_policy.as_str()),
            ("x-frame-options", self.x_frame_options.as_str()),
            ("x-xss-protection", self.x_xss_protection.as_str()),
            (STRICT_TRANSPORT_SECURITY, self.strict_transport_security.as_str()),
            ("x-content-type-options", self.x_content_type_options.as_str()),
            ("referrer-policy", self.referrer_policy.as_str()),
            ("permissions-policy", self.permissions_policy.as_str()),
            ("x-download-options", self.x_download_options.as_str()),
            ("x-dns-prefetch-control", self.x_dns_prefetch_control.as_str()),
        ]
    }

    pub fn validate(&self) -> SecurityResult<()> {
        for (name, value) in self.entries() {
            if !value.is_empty() && http::HeaderValue::from_str(value).is_err() {
                return Err(SecurityError::invalid_config(
                    format!("security_headers.{}", name),
                    "contains characters not allowed in a header value",
                ));
            }
        }
        Ok(())
    }
}
