//! CSRF (Cross-Site Request Forgery) protection
//!
//! Tokens are bound to a server-side session: the expected value lives in the
//! session under `token_session_key` and every state-changing request from an
//! authenticated session must echo it back in a header or form field.

use std::collections::HashSet;
use std::sync::Arc;

use http::StatusCode;
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use warden_http::{WardenRequest, WardenResponse};

use super::write_denial;
use crate::session::{Session, SessionStore};
use crate::stats::SecurityStats;
use crate::{SecurityError, SecurityResult};

pub use crate::config::CsrfConfig;

/// Request parameter carrying the session identifier
pub const SESSION_ID_PARAM: &str = "session_id";

/// Why a request failed CSRF validation
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfRejection {
    #[error("Session not found for CSRF validation.")]
    MissingSession,

    #[error("Invalid or expired session for CSRF validation.")]
    InvalidSession,

    #[error("Invalid or missing CSRF token.")]
    InvalidToken,
}

impl CsrfRejection {
    pub fn status(&self) -> StatusCode {
        StatusCode::FORBIDDEN
    }

    /// Populate a 403 response with the JSON denial body
    pub fn write_to(&self, response: &mut WardenResponse) {
        write_denial(response, self.status(), &self.to_string());
    }
}

/// Generates, stores and validates per-session anti-forgery tokens
#[derive(Clone)]
pub struct CsrfGuard {
    config: CsrfConfig,
    sessions: Arc<dyn SessionStore>,
    stats: Arc<SecurityStats>,
}

impl std::fmt::Debug for CsrfGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrfGuard")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CsrfGuard {
    /// Create a guard backed by `sessions`. Protected methods are matched
    /// case-insensitively.
    pub fn new(mut config: CsrfConfig, sessions: Arc<dyn SessionStore>) -> Self {
        config.protected_methods = config
            .protected_methods
            .iter()
            .map(|method| method.to_ascii_uppercase())
            .collect::<HashSet<_>>();

        Self {
            config,
            sessions,
            stats: Arc::new(SecurityStats::new()),
        }
    }

    /// Report denials into a shared stats instance
    pub fn with_stats(mut self, stats: Arc<SecurityStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    /// Only authenticated requests using a protected method are checked
    pub fn should_protect(&self, method: &str, authenticated: bool) -> bool {
        authenticated
            && self
                .config
                .protected_methods
                .contains(&method.to_ascii_uppercase())
    }

    /// Derive a fresh token for `session_id`.
    ///
    /// SHA-256 over a random UUID, the session id and an independent random
    /// value, hex encoded (64 characters).
    pub fn generate_token(&self, session_id: &str) -> String {
        let nonce: u64 = thread_rng().gen();

        let mut hasher = Sha256::new();
        hasher.update(Uuid::new_v4().as_bytes());
        hasher.update(session_id.as_bytes());
        hasher.update(nonce.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    /// Generate a token and store it in the session as the expected value
    pub fn issue_token(&self, session_id: &str) -> SecurityResult<String> {
        let session = self
            .resolve_session(session_id)
            .ok_or_else(|| SecurityError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        Ok(self.store_new_token(session.as_ref()))
    }

    /// Validate the request, writing a 403 denial into `response` on failure
    pub fn validate(
        &self,
        request: &WardenRequest,
        authenticated: bool,
        response: &mut WardenResponse,
    ) -> bool {
        match self.check(request, authenticated) {
            Ok(()) => true,
            Err(rejection) => {
                self.stats.record_csrf_denial();
                tracing::warn!(
                    method = %request.method,
                    path = request.path(),
                    reason = %rejection,
                    "CSRF validation failed"
                );
                rejection.write_to(response);
                false
            }
        }
    }

    /// Validation without response mutation
    pub fn check(&self, request: &WardenRequest, authenticated: bool) -> Result<(), CsrfRejection> {
        if !self.should_protect(request.method_str(), authenticated) {
            return Ok(());
        }

        let session_id = request
            .param(SESSION_ID_PARAM)
            .filter(|id| !id.is_empty())
            .ok_or(CsrfRejection::MissingSession)?;

        let session = self
            .resolve_session(session_id)
            .ok_or(CsrfRejection::InvalidSession)?;

        let expected = session
            .value(&self.config.token_session_key)
            .unwrap_or_default();
        let received = self.received_token(request).unwrap_or_default();

        if expected.is_empty() || received.is_empty() || !tokens_match(&expected, received) {
            return Err(CsrfRejection::InvalidToken);
        }
        Ok(())
    }

    /// Rotate the session's token and mirror it into the response header.
    /// Returns `None` without side effects when no live session resolves.
    pub fn refresh_token(
        &self,
        request: &WardenRequest,
        response: &mut WardenResponse,
    ) -> Option<String> {
        let session = request
            .param(SESSION_ID_PARAM)
            .filter(|id| !id.is_empty())
            .and_then(|id| self.resolve_session(id))?;

        let token = self.store_new_token(session.as_ref());
        if let Err(e) = response.add_header(&self.config.token_header, &token) {
            tracing::warn!("Failed to add {} header: {}", self.config.token_header, e);
        }
        tracing::debug!(session_id = session.id(), "CSRF token rotated");
        Some(token)
    }

    /// Token from the configured header, else the form field for
    /// form-url-encoded bodies
    fn received_token<'a>(&self, request: &'a WardenRequest) -> Option<&'a str> {
        request
            .header_str(&self.config.token_header)
            .filter(|token| !token.is_empty())
            .or_else(|| {
                if request.is_form_urlencoded() {
                    request.form_param(&self.config.token_form_field)
                } else {
                    None
                }
            })
    }

    fn resolve_session(&self, session_id: &str) -> Option<Arc<dyn Session>> {
        self.sessions
            .session_by_id(session_id)
            .filter(|session| !session.is_expired())
    }

    fn store_new_token(&self, session: &dyn Session) -> String {
        let token = self.generate_token(session.id());
        session.set_value(&self.config.token_session_key, &token);
        token
    }
}

/// Constant-time comparison over the full byte sequences
fn tokens_match(expected: &str, received: &str) -> bool {
    expected.as_bytes().ct_eq(received.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionStore;
    use axum::body::Bytes;
    use http::{HeaderMap, Method};

    fn guard_with_store() -> (CsrfGuard, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        let guard = CsrfGuard::new(CsrfConfig::default(), store.clone());
        (guard, store)
    }

    fn post(uri: &str) -> WardenRequest {
        WardenRequest::new(Method::POST, uri.parse().unwrap(), HeaderMap::new())
    }

    #[test]
    fn test_should_protect_only_authenticated_mutations() {
        let (guard, _) = guard_with_store();

        for method in ["POST", "PUT", "DELETE", "PATCH", "post", "Patch"] {
            assert!(guard.should_protect(method, true), "{} should be protected", method);
            assert!(!guard.should_protect(method, false));
        }
        for method in ["GET", "HEAD", "OPTIONS"] {
            assert!(!guard.should_protect(method, true));
            assert!(!guard.should_protect(method, false));
        }
    }

    #[test]
    fn test_configured_methods_are_normalized() {
        let store = Arc::new(InMemorySessionStore::new());
        let config = CsrfConfig {
            protected_methods: ["delete".to_string()].into_iter().collect(),
            ..CsrfConfig::default()
        };
        let guard = CsrfGuard::new(config, store);

        assert!(guard.should_protect("DELETE", true));
        assert!(!guard.should_protect("POST", true));
    }

    #[test]
    fn test_generated_tokens_are_unique_and_opaque() {
        let (guard, _) = guard_with_store();

        let token1 = guard.generate_token("session-1");
        let token2 = guard.generate_token("session-1");

        assert_ne!(token1, token2);
        assert_eq!(token1.len(), 64);
        assert!(token1.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!token1.contains("session-1"));
    }

    #[test]
    fn test_issue_token_requires_live_session() {
        let (guard, store) = guard_with_store();
        let session = store.create_session_with_id("s1");

        let token = guard.issue_token("s1").unwrap();
        assert_eq!(session.value("csrf_token"), Some(token));

        assert!(matches!(
            guard.issue_token("missing"),
            Err(SecurityError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn test_unprotected_and_anonymous_requests_pass() {
        let (guard, _) = guard_with_store();
        let get = WardenRequest::new(Method::GET, "/".parse().unwrap(), HeaderMap::new());

        assert_eq!(guard.check(&get, true), Ok(()));
        assert_eq!(guard.check(&post("/"), false), Ok(()));
    }

    #[test]
    fn test_missing_session_id_rejected() {
        let (guard, _) = guard_with_store();

        assert_eq!(
            guard.check(&post("/?user_id=1"), true),
            Err(CsrfRejection::MissingSession)
        );
    }

    #[test]
    fn test_unknown_or_expired_session_rejected() {
        let (guard, _) = guard_with_store();
        assert_eq!(
            guard.check(&post("/?session_id=nope"), true),
            Err(CsrfRejection::InvalidSession)
        );

        let expired_store = Arc::new(InMemorySessionStore::with_lifetime(time::Duration::seconds(-1)));
        expired_store.create_session_with_id("old");
        let guard = CsrfGuard::new(CsrfConfig::default(), expired_store);
        assert_eq!(
            guard.check(&post("/?session_id=old"), true),
            Err(CsrfRejection::InvalidSession)
        );
    }

    #[test]
    fn test_header_token_accepted() {
        let (guard, store) = guard_with_store();
        store.create_session_with_id("s1");
        let token = guard.issue_token("s1").unwrap();

        let mut request = post("/?session_id=s1");
        request.add_header("X-CSRF-Token", &token).unwrap();

        assert_eq!(guard.check(&request, true), Ok(()));
    }

    #[test]
    fn test_stale_and_foreign_tokens_rejected() {
        let (guard, store) = guard_with_store();
        store.create_session_with_id("s1");
        store.create_session_with_id("s2");
        let stale = guard.issue_token("s1").unwrap();
        let current = guard.issue_token("s1").unwrap();
        let foreign = guard.issue_token("s2").unwrap();

        for candidate in [stale.as_str(), foreign.as_str(), &current[..63], "x"] {
            let mut request = post("/?session_id=s1");
            request.add_header("X-CSRF-Token", candidate).unwrap();
            assert_eq!(
                guard.check(&request, true),
                Err(CsrfRejection::InvalidToken),
                "{} should be rejected",
                candidate
            );
        }
    }

    #[test]
    fn test_empty_tokens_rejected() {
        let (guard, store) = guard_with_store();
        let session = store.create_session_with_id("s1");

        // Nothing stored and nothing sent
        assert_eq!(
            guard.check(&post("/?session_id=s1"), true),
            Err(CsrfRejection::InvalidToken)
        );

        // Stored empty value never matches an empty submission
        session.set_value("csrf_token", "");
        let mut request = post("/?session_id=s1");
        request.add_header("X-CSRF-Token", "").unwrap();
        assert_eq!(guard.check(&request, true), Err(CsrfRejection::InvalidToken));
    }

    #[test]
    fn test_form_field_fallback_only_for_urlencoded() {
        let (guard, store) = guard_with_store();
        store.create_session_with_id("s1");
        let token = guard.issue_token("s1").unwrap();
        let body = format!("session_id=s1&__CSRFToken__={}", token);

        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/x-www-form-urlencoded".parse().unwrap());
        let form = WardenRequest::new(Method::POST, "/".parse().unwrap(), headers)
            .with_body(Bytes::from(body));
        assert_eq!(guard.check(&form, true), Ok(()));

        let mut json = post("/?session_id=s1");
        json.add_header("content-type", "application/json").unwrap();
        json.add_form_param("__CSRFToken__", token);
        assert_eq!(guard.check(&json, true), Err(CsrfRejection::InvalidToken));
    }

    #[test]
    fn test_validate_writes_denial_response() {
        let (guard, _) = guard_with_store();
        let mut response = WardenResponse::new();

        assert!(!guard.validate(&post("/?user_id=1"), true, &mut response));
        assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.json_body(),
            Some(&serde_json::json!({
                "success": false,
                "error": "Session not found for CSRF validation."
            }))
        );
        assert_eq!(guard.stats.snapshot().csrf_denials, 1);
    }

    #[test]
    fn test_refresh_token_rotates_and_mirrors_header() {
        let (guard, store) = guard_with_store();
        let session = store.create_session_with_id("s1");
        let old = guard.issue_token("s1").unwrap();

        let mut response = WardenResponse::new();
        let new = guard
            .refresh_token(&post("/?session_id=s1"), &mut response)
            .unwrap();

        assert_ne!(old, new);
        assert_eq!(session.value("csrf_token"), Some(new.clone()));
        assert_eq!(response.header_str("x-csrf-token"), Some(new.as_str()));
    }

    #[test]
    fn test_refresh_token_without_session_is_noop() {
        let (guard, _) = guard_with_store();
        let mut response = WardenResponse::new();

        assert!(guard.refresh_token(&post("/"), &mut response).is_none());
        assert!(guard
            .refresh_token(&post("/?session_id=ghost"), &mut response)
            .is_none());
        assert!(!response.has_header("x-csrf-token"));
    }

    #[test]
    fn test_tokens_match_requires_equal_length_and_content() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abd"));
        assert!(!tokens_match("abc", "abcd"));
        assert!(!tokens_match("abcd", "abc"));
    }
}
