//! # warden-security
//!
//! Request-validation middleware for the warden stack.
//! Applies security response headers, per-client rate limiting and CSRF token
//! validation before a request reaches application logic.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use warden_http::{HeaderMap, Method, WardenRequest, WardenResponse};
//! use warden_security::{InMemorySessionStore, SecurityConfig, SecurityPipeline};
//!
//! # tokio_test::block_on(async {
//! let sessions = Arc::new(InMemorySessionStore::new());
//! let pipeline = SecurityPipeline::builder()
//!     .config(SecurityConfig::default())
//!     .session_store(sessions.clone())
//!     .build()
//!     .unwrap();
//!
//! // Background eviction of idle clients
//! pipeline.start().unwrap();
//!
//! let request = WardenRequest::new(Method::GET, "/".parse().unwrap(), HeaderMap::new());
//! let mut response = WardenResponse::new();
//! assert!(pipeline.validate(&request, &mut response));
//! assert_eq!(response.header_str("x-content-type-options"), Some("nosniff"));
//!
//! pipeline.shutdown().await;
//! # });
//! ```

pub mod config;
pub mod layer;
pub mod middleware;
pub mod pipeline;
pub mod session;
pub mod stats;

// Re-export main types
pub use config::*;
pub use layer::security_middleware;
pub use middleware::csrf::{CsrfGuard, CsrfRejection};
pub use middleware::rate_limit::{ClientLimitState, RateLimitDecision, RateLimiter};
pub use middleware::security_headers::HeaderPolicy;
pub use pipeline::{SecurityPipeline, SecurityPipelineBuilder};
pub use session::{InMemorySessionStore, Session, SessionStore};
pub use stats::{SecurityStats, StatsSnapshot};

/// Common result type for security operations
pub type SecurityResult<T> = Result<T, SecurityError>;

/// Security-related errors
#[derive(thiserror::Error, Debug)]
pub enum SecurityError {
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Rate limiter state lock poisoned")]
    LockPoisoned,

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl SecurityError {
    pub(crate) fn invalid_config<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        SecurityError::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
