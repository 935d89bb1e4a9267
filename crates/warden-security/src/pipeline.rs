//! Security pipeline
//!
//! Composes the header policy, rate limiter and CSRF guard into a single
//! per-request decision. Headers are applied first and unconditionally, then the
//! rate limit, then CSRF; the first denial short-circuits with the response
//! already populated.

use std::net::IpAddr;
use std::sync::Arc;

use warden_http::{WardenRequest, WardenResponse};

use crate::config::{ClientIdentifier, SecurityConfig};
use crate::middleware::csrf::{CsrfGuard, SESSION_ID_PARAM};
use crate::middleware::rate_limit::RateLimiter;
use crate::middleware::security_headers::HeaderPolicy;
use crate::session::SessionStore;
use crate::stats::{SecurityStats, StatsSnapshot};
use crate::{SecurityError, SecurityResult};

/// Request parameter identifying the authenticated user
pub const USER_ID_PARAM: &str = "user_id";

/// Client identifier used when no address can be resolved
const UNKNOWN_CLIENT: &str = "unknown";

/// Request-validation pipeline owning one of each security component
#[derive(Debug)]
pub struct SecurityPipeline {
    headers: HeaderPolicy,
    rate_limiter: RateLimiter,
    csrf: CsrfGuard,
    identifier: ClientIdentifier,
    transport_encrypted: bool,
    stats: Arc<SecurityStats>,
}

impl SecurityPipeline {
    pub fn builder() -> SecurityPipelineBuilder {
        SecurityPipelineBuilder::new()
    }

    /// Validate one request, mutating `response` (headers always; status and
    /// body on denial). Returns `false` when the caller must stop and send the
    /// response as-is.
    pub fn validate(&self, request: &WardenRequest, response: &mut WardenResponse) -> bool {
        self.stats.record_request();

        self.headers
            .apply_to(response, self.transport_encrypted || request.is_secure());

        let client_id = self.client_id(request);
        let decision = self.rate_limiter.is_limited(&client_id);
        if decision.denied {
            decision.write_to(response);
            return false;
        }

        let authenticated = is_authenticated(request);
        if self
            .csrf
            .should_protect(request.method_str(), authenticated)
            && !self.csrf.validate(request, authenticated, response)
        {
            return false;
        }

        true
    }

    /// Entry point for servers whose request or response may be missing.
    /// Absent handles are denied and logged.
    pub fn validate_handles(
        &self,
        request: Option<&WardenRequest>,
        response: Option<&mut WardenResponse>,
    ) -> bool {
        match (request, response) {
            (Some(request), Some(response)) => self.validate(request, response),
            (request, response) => {
                tracing::error!(
                    request_present = request.is_some(),
                    response_present = response.is_some(),
                    "Security validation called without request or response"
                );
                false
            }
        }
    }

    /// Rotate the CSRF token of the request's session, see [`CsrfGuard::refresh_token`]
    pub fn refresh_csrf_token(
        &self,
        request: &WardenRequest,
        response: &mut WardenResponse,
    ) -> Option<String> {
        self.csrf.refresh_token(request, response)
    }

    /// Clear rate limit tracking for one client
    pub fn reset_client(&self, client_id: &str) -> bool {
        self.rate_limiter.reset(client_id)
    }

    /// Rate limiting key for `request` under the configured strategy
    pub fn client_id(&self, request: &WardenRequest) -> String {
        if self.identifier == ClientIdentifier::ForwardedFor {
            let forwarded = request
                .header_str("x-forwarded-for")
                .and_then(|value| value.split(',').next())
                .and_then(parse_forwarded_ip)
                .or_else(|| request.header_str("x-real-ip").and_then(parse_forwarded_ip));
            if let Some(ip) = forwarded {
                return ip.to_string();
            }
        }

        request
            .remote_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }

    /// Launch the rate limiter's background sweeper on the current tokio runtime
    pub fn start(&self) -> SecurityResult<()> {
        self.rate_limiter.start_sweeper()
    }

    /// Stop the sweeper and wait for it to finish
    pub async fn shutdown(&self) {
        self.rate_limiter.stop_sweeper().await;
        tracing::info!("Security pipeline shut down");
    }

    pub fn header_policy(&self) -> &HeaderPolicy {
        &self.headers
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn csrf_guard(&self) -> &CsrfGuard {
        &self.csrf
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// Trimmed header entry, if it is an IP address
fn parse_forwarded_ip(value: &str) -> Option<&str> {
    let value = value.trim();
    value.parse::<IpAddr>().ok().map(|_| value)
}

/// Minimal authentication proxy: both identifying parameters are present
fn is_authenticated(request: &WardenRequest) -> bool {
    let present = |name: &str| request.param(name).map_or(false, |value| !value.is_empty());
    present(USER_ID_PARAM) && present(SESSION_ID_PARAM)
}

/// Builder for [`SecurityPipeline`]
#[derive(Default)]
pub struct SecurityPipelineBuilder {
    config: SecurityConfig,
    session_store: Option<Arc<dyn SessionStore>>,
}

impl SecurityPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: SecurityConfig) -> Self {
        self.config = config;
        self
    }

    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    /// Validate the configuration and assemble the pipeline.
    ///
    /// Fails when no session store was supplied or the configuration is invalid.
    pub fn build(self) -> SecurityResult<SecurityPipeline> {
        let session_store = self.session_store.ok_or_else(|| SecurityError::ConfigError {
            message: "CSRF protection requires a session store".to_string(),
        })?;
        self.config.validate()?;

        let stats = Arc::new(SecurityStats::new());
        let SecurityConfig {
            rate_limiting,
            csrf,
            security_headers,
            transport_encrypted,
        } = self.config;

        let identifier = rate_limiting.identifier;
        let pipeline = SecurityPipeline {
            headers: HeaderPolicy::new(security_headers).with_stats(Arc::clone(&stats)),
            rate_limiter: RateLimiter::new(rate_limiting).with_stats(Arc::clone(&stats)),
            csrf: CsrfGuard::new(csrf, session_store).with_stats(Arc::clone(&stats)),
            identifier,
            transport_encrypted,
            stats,
        };

        tracing::info!(
            max_requests = pipeline.rate_limiter.config().max_requests,
            burst_limit = pipeline.rate_limiter.burst_limit(),
            transport_encrypted,
            "Security pipeline configured"
        );
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::session::InMemorySessionStore;
    use http::{HeaderMap, Method, StatusCode};
    use std::net::SocketAddr;
    use tracing_test::traced_test;

    fn pipeline_with(config: SecurityConfig) -> (SecurityPipeline, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        let pipeline = SecurityPipeline::builder()
            .config(config)
            .session_store(store.clone())
            .build()
            .unwrap();
        (pipeline, store)
    }

    fn request(method: Method, uri: &str) -> WardenRequest {
        let addr: SocketAddr = "1.2.3.4:50000".parse().unwrap();
        WardenRequest::new(method, uri.parse().unwrap(), HeaderMap::new()).with_remote_addr(addr)
    }

    #[test]
    fn test_build_without_session_store_fails() {
        let result = SecurityPipeline::builder().build();

        assert!(matches!(result, Err(SecurityError::ConfigError { .. })));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = SecurityConfig::default();
        config.rate_limiting.window_seconds = 0;

        let result = SecurityPipeline::builder()
            .config(config)
            .session_store(Arc::new(InMemorySessionStore::new()))
            .build();

        assert!(matches!(result, Err(SecurityError::InvalidConfig { .. })));
    }

    #[test]
    fn test_anonymous_get_allowed_with_headers() {
        let (pipeline, _) = pipeline_with(SecurityConfig::default());
        let mut response = WardenResponse::new();

        assert!(pipeline.validate(&request(Method::GET, "/"), &mut response));
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.header_str("x-frame-options"), Some("SAMEORIGIN"));
        assert!(!response.has_header("strict-transport-security"));
    }

    #[test]
    fn test_hsts_emitted_when_endpoint_encrypted() {
        let config = SecurityConfig {
            transport_encrypted: true,
            ..SecurityConfig::default()
        };
        let (pipeline, _) = pipeline_with(config);
        let mut response = WardenResponse::new();

        pipeline.validate(&request(Method::GET, "/"), &mut response);

        assert!(response.has_header("strict-transport-security"));
    }

    #[test]
    fn test_hsts_emitted_for_secure_request() {
        let (pipeline, _) = pipeline_with(SecurityConfig::default());
        let mut response = WardenResponse::new();

        pipeline.validate(&request(Method::GET, "/").with_secure(true), &mut response);

        assert!(response.has_header("strict-transport-security"));
    }

    #[test]
    fn test_anonymous_post_skips_csrf() {
        let (pipeline, _) = pipeline_with(SecurityConfig::default());
        let mut response = WardenResponse::new();

        assert!(pipeline.validate(&request(Method::POST, "/?session_id=s1"), &mut response));
    }

    #[test]
    fn test_authenticated_post_with_token_allowed() {
        let (pipeline, store) = pipeline_with(SecurityConfig::default());
        store.create_session_with_id("s1");
        let token = pipeline.csrf_guard().issue_token("s1").unwrap();

        let mut req = request(Method::POST, "/orders?session_id=s1&user_id=42");
        req.add_header("X-CSRF-Token", &token).unwrap();
        let mut response = WardenResponse::new();

        assert!(pipeline.validate(&req, &mut response));
        assert_eq!(response.status_code(), StatusCode::OK);
        assert!(response.has_header("content-security-policy"));
    }

    #[test]
    fn test_authenticated_post_without_token_denied_with_headers() {
        let (pipeline, store) = pipeline_with(SecurityConfig::default());
        store.create_session_with_id("s1");
        pipeline.csrf_guard().issue_token("s1").unwrap();

        let mut req = request(Method::POST, "/orders?session_id=s1&user_id=42");
        req.add_header("content-type", "application/json").unwrap();
        let mut response = WardenResponse::new();

        assert!(!pipeline.validate(&req, &mut response));
        assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.json_body().unwrap()["error"],
            "Invalid or missing CSRF token."
        );
        // Defensive headers are present on denials too
        assert_eq!(response.header_str("x-content-type-options"), Some("nosniff"));
        assert_eq!(pipeline.stats().csrf_denials, 1);
    }

    #[test]
    fn test_rate_limit_denial_short_circuits_csrf() {
        let config = SecurityConfig {
            rate_limiting: RateLimitConfig {
                max_requests: 1,
                burst_limit: Some(1),
                ..RateLimitConfig::default()
            },
            ..SecurityConfig::default()
        };
        let (pipeline, _) = pipeline_with(config);
        let req = request(Method::POST, "/?session_id=missing&user_id=1");

        // First request reaches CSRF and fails there
        let mut first = WardenResponse::new();
        assert!(!pipeline.validate(&req, &mut first));
        assert_eq!(first.status_code(), StatusCode::FORBIDDEN);

        let mut second = WardenResponse::new();
        assert!(!pipeline.validate(&req, &mut second));
        assert_eq!(second.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.header_str("retry-after"), Some("300"));
        assert!(second.has_header("x-frame-options"));

        let stats = pipeline.stats();
        assert_eq!(stats.requests_validated, 2);
        assert_eq!(stats.rate_limit_denials, 1);
        assert_eq!(stats.csrf_denials, 1);
    }

    #[test]
    fn test_reset_client_unblocks() {
        let config = SecurityConfig {
            rate_limiting: RateLimitConfig {
                max_requests: 1,
                burst_limit: Some(1),
                ..RateLimitConfig::default()
            },
            ..SecurityConfig::default()
        };
        let (pipeline, _) = pipeline_with(config);
        let req = request(Method::GET, "/");

        pipeline.validate(&req, &mut WardenResponse::new());
        assert!(!pipeline.validate(&req, &mut WardenResponse::new()));

        assert!(pipeline.reset_client("1.2.3.4"));
        assert!(pipeline.validate(&req, &mut WardenResponse::new()));
    }

    #[traced_test]
    #[test]
    fn test_missing_handles_denied_and_logged() {
        let (pipeline, _) = pipeline_with(SecurityConfig::default());
        let req = request(Method::GET, "/");
        let mut response = WardenResponse::new();

        assert!(!pipeline.validate_handles(None, Some(&mut response)));
        assert!(!pipeline.validate_handles(Some(&req), None));
        assert!(logs_contain("without request or response"));
        assert!(pipeline.validate_handles(Some(&req), Some(&mut response)));
    }

    #[test]
    fn test_client_id_strategies() {
        let (remote, _) = pipeline_with(SecurityConfig::default());
        let mut config = SecurityConfig::default();
        config.rate_limiting.identifier = ClientIdentifier::ForwardedFor;
        let (forwarded, _) = pipeline_with(config);

        let mut req = request(Method::GET, "/");
        req.add_header("x-forwarded-for", "203.0.113.9, 10.0.0.1").unwrap();
        assert_eq!(remote.client_id(&req), "1.2.3.4");
        assert_eq!(forwarded.client_id(&req), "203.0.113.9");

        let mut real_ip = request(Method::GET, "/");
        real_ip.add_header("x-real-ip", "198.51.100.7").unwrap();
        assert_eq!(forwarded.client_id(&real_ip), "198.51.100.7");

        let mut garbage = request(Method::GET, "/");
        garbage.add_header("x-forwarded-for", "not-an-ip").unwrap();
        assert_eq!(forwarded.client_id(&garbage), "1.2.3.4");

        // An unusable forwarded entry still falls through to X-Real-IP
        garbage.add_header("x-real-ip", "198.51.100.8").unwrap();
        assert_eq!(forwarded.client_id(&garbage), "198.51.100.8");

        let anonymous = WardenRequest::new(Method::GET, "/".parse().unwrap(), HeaderMap::new());
        assert_eq!(remote.client_id(&anonymous), "unknown");
    }

    #[test]
    fn test_is_authenticated_requires_both_params() {
        assert!(is_authenticated(&request(Method::POST, "/?user_id=1&session_id=s")));
        assert!(!is_authenticated(&request(Method::POST, "/?user_id=1")));
        assert!(!is_authenticated(&request(Method::POST, "/?session_id=s")));
        assert!(!is_authenticated(&request(Method::POST, "/?user_id=&session_id=s")));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (pipeline, _) = pipeline_with(SecurityConfig::default());

        pipeline.start().unwrap();
        assert!(pipeline.rate_limiter().is_sweeper_running());

        pipeline.shutdown().await;
        assert!(!pipeline.rate_limiter().is_sweeper_running());
    }
}
