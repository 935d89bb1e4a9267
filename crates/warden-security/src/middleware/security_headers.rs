//! Security headers policy
//!
//! Applies CSP, X-Frame-Options, HSTS and the other defensive headers to every
//! response the pipeline touches, including denials.

use std::sync::Arc;

use warden_http::WardenResponse;

use crate::config::STRICT_TRANSPORT_SECURITY;
use crate::stats::SecurityStats;

pub use crate::config::SecurityHeadersConfig;

/// Fixed set of security header values applied to outgoing responses
#[derive(Debug, Clone)]
pub struct HeaderPolicy {
    config: SecurityHeadersConfig,
    stats: Arc<SecurityStats>,
}

impl HeaderPolicy {
    /// Create new header policy with configuration
    pub fn new(config: SecurityHeadersConfig) -> Self {
        Self {
            config,
            stats: Arc::new(SecurityStats::new()),
        }
    }

    /// Strict production settings
    pub fn strict() -> Self {
        Self::new(SecurityHeadersConfig::strict())
    }

    /// Development-friendly settings (no HSTS, permissive CSP)
    pub fn development() -> Self {
        Self::new(SecurityHeadersConfig::development())
    }

    /// Settings for API endpoints
    pub fn api_focused() -> Self {
        Self::new(SecurityHeadersConfig::api_focused())
    }

    /// Report withheld headers into a shared stats instance
    pub fn with_stats(mut self, stats: Arc<SecurityStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn config(&self) -> &SecurityHeadersConfig {
        &self.config
    }

    /// Set every configured header on `response`.
    ///
    /// Strict-Transport-Security is only emitted when `transport_encrypted` is
    /// true; a configured but withheld HSTS value is logged and counted.
    pub fn apply_to(&self, response: &mut WardenResponse, transport_encrypted: bool) {
        for (name, value) in self.config.entries() {
            if value.is_empty() {
                continue;
            }

            if name == STRICT_TRANSPORT_SECURITY && !transport_encrypted {
                tracing::debug!(
                    header = STRICT_TRANSPORT_SECURITY,
                    "Withholding HSTS header: transport encryption not guaranteed"
                );
                self.stats.record_hsts_withheld();
                continue;
            }

            if let Err(e) = response.add_header(name, value) {
                tracing::warn!("Failed to add {} header: {}", name, e);
            }
        }
    }
}

impl Default for HeaderPolicy {
    fn default() -> Self {
        Self::new(SecurityHeadersConfig::default())
    }
}
