//! Rate limiting implementation
//!
//! Tracks request frequency per client with a window plus burst allowance.
//! Exceeding `max_requests` inside a window only logs a soft-limit warning;
//! exceeding the burst limit blocks the client for `block_minutes`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use http::StatusCode;
use time::{OffsetDateTime, PrimitiveDateTime};
use warden_http::WardenResponse;

use super::sweeper::{self, SweeperHandle};
use super::write_denial;
use crate::stats::SecurityStats;
use crate::{SecurityError, SecurityResult};

pub use crate::config::{ClientIdentifier, RateLimitConfig};

pub const RATE_LIMIT_MESSAGE: &str = "Rate limit exceeded. Please try again later.";

pub(crate) type ClientMap = HashMap<String, ClientLimitState>;

/// Tracking state for one client identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientLimitState {
    /// Start of the current window
    pub last_request_time: OffsetDateTime,
    /// Requests counted since the window last reset
    pub request_count: u32,
    /// Requests are denied while `now` is before this instant
    pub blocked_until: Option<OffsetDateTime>,
}

impl ClientLimitState {
    fn new(now: OffsetDateTime) -> Self {
        Self {
            last_request_time: now,
            request_count: 1,
            blocked_until: None,
        }
    }

    pub fn is_blocked_at(&self, now: OffsetDateTime) -> bool {
        self.blocked_until.map_or(false, |until| now < until)
    }

    pub(crate) fn is_evictable_at(&self, now: OffsetDateTime, idle: time::Duration) -> bool {
        let unblocked = self.blocked_until.map_or(true, |until| now > until);
        unblocked && now - self.last_request_time > idle
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub denied: bool,
    /// Seconds the client should wait before retrying; zero when allowed
    pub retry_after_seconds: u64,
}

impl RateLimitDecision {
    pub fn allowed() -> Self {
        Self {
            denied: false,
            retry_after_seconds: 0,
        }
    }

    pub fn denied(retry_after_seconds: u64) -> Self {
        Self {
            denied: true,
            retry_after_seconds,
        }
    }

    /// Populate a 429 response with JSON body and `Retry-After`
    pub fn write_to(&self, response: &mut WardenResponse) {
        write_denial(response, StatusCode::TOO_MANY_REQUESTS, RATE_LIMIT_MESSAGE);
        if let Err(e) = response.add_header("Retry-After", self.retry_after_seconds.to_string()) {
            tracing::warn!("Failed to add Retry-After header: {}", e);
        }
    }
}

/// What happened to a client's counters; logged after the lock is released
enum Outcome {
    First,
    Allowed,
    SoftLimited { count: u32 },
    NewlyBlocked { count: u32 },
    StillBlocked,
}

/// Per-client rate limiter with a background sweeper
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    burst_limit: u32,
    clients: Arc<Mutex<ClientMap>>,
    sweeper: Mutex<Option<SweeperHandle>>,
    stats: Arc<SecurityStats>,
}

impl RateLimiter {
    /// Create a limiter from an already validated configuration
    pub fn new(config: RateLimitConfig) -> Self {
        let burst_limit = config.effective_burst_limit();
        Self {
            config,
            burst_limit,
            clients: Arc::new(Mutex::new(HashMap::new())),
            sweeper: Mutex::new(None),
            stats: Arc::new(SecurityStats::new()),
        }
    }

    /// Report events into a shared stats instance
    pub fn with_stats(mut self, stats: Arc<SecurityStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn burst_limit(&self) -> u32 {
        self.burst_limit
    }

    /// Check and count one request from `client_id` at the current time
    pub fn is_limited(&self, client_id: &str) -> RateLimitDecision {
        self.check_at(client_id, OffsetDateTime::now_utc())
    }

    /// Check and count one request from `client_id` observed at `now`
    pub fn check_at(&self, client_id: &str, now: OffsetDateTime) -> RateLimitDecision {
        let outcome = match self.record(client_id, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Poisoned state fails open
                tracing::error!("Rate limiting check failed: {}", e);
                return RateLimitDecision::allowed();
            }
        };

        match outcome {
            Outcome::First | Outcome::Allowed => RateLimitDecision::allowed(),
            Outcome::SoftLimited { count } => {
                self.stats.record_soft_limit();
                tracing::warn!(
                    client_id,
                    count,
                    limit = self.config.max_requests,
                    "Soft rate limit exceeded"
                );
                RateLimitDecision::allowed()
            }
            Outcome::NewlyBlocked { count } => {
                self.stats.record_rate_limit_denial();
                tracing::warn!(
                    client_id,
                    count,
                    burst_limit = self.burst_limit,
                    block_minutes = self.config.block_minutes,
                    "Burst limit exceeded, blocking client"
                );
                RateLimitDecision::denied(self.config.retry_after_seconds())
            }
            Outcome::StillBlocked => {
                self.stats.record_rate_limit_denial();
                tracing::debug!(client_id, "Request from blocked client denied");
                RateLimitDecision::denied(self.config.retry_after_seconds())
            }
        }
    }

    fn record(&self, client_id: &str, now: OffsetDateTime) -> SecurityResult<Outcome> {
        let mut clients = self.clients.lock().map_err(|_| SecurityError::LockPoisoned)?;

        let state = match clients.entry(client_id.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(ClientLimitState::new(now));
                return Ok(Outcome::First);
            }
            Entry::Occupied(entry) => entry.into_mut(),
        };

        // Counters are frozen while blocked
        if state.is_blocked_at(now) {
            return Ok(Outcome::StillBlocked);
        }
        state.blocked_until = None;

        if now - state.last_request_time > self.config.window() {
            state.request_count = 1;
            state.last_request_time = now;
        } else {
            state.request_count = state.request_count.saturating_add(1);
        }

        let count = state.request_count;
        if count > self.burst_limit {
            let until = now
                .checked_add(self.config.block_duration())
                .unwrap_or_else(|| PrimitiveDateTime::MAX.assume_utc());
            state.blocked_until = Some(until);
            Ok(Outcome::NewlyBlocked { count })
        } else if count > self.config.max_requests {
            Ok(Outcome::SoftLimited { count })
        } else {
            Ok(Outcome::Allowed)
        }
    }

    /// Forget everything about `client_id`, clearing any block.
    /// Returns whether the client was tracked.
    pub fn reset(&self, client_id: &str) -> bool {
        let removed = match self.clients.lock() {
            Ok(mut clients) => clients.remove(client_id).is_some(),
            Err(_) => {
                tracing::error!("Rate limit reset failed: {}", SecurityError::LockPoisoned);
                return false;
            }
        };
        if removed {
            tracing::info!(client_id, "Rate limit state reset");
        }
        removed
    }

    /// Copy of the current state for `client_id`
    pub fn client_state(&self, client_id: &str) -> Option<ClientLimitState> {
        self.clients
            .lock()
            .ok()
            .and_then(|clients| clients.get(client_id).copied())
    }

    /// Number of clients currently tracked
    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().map(|clients| clients.len()).unwrap_or(0)
    }

    /// Run one eviction pass as of `now`, returning how many entries were removed
    pub fn sweep_at(&self, now: OffsetDateTime) -> SecurityResult<usize> {
        let evicted = sweeper::sweep_clients(&self.clients, now, self.config.idle_threshold())?;
        if evicted > 0 {
            self.stats.record_evictions(evicted);
        }
        Ok(evicted)
    }

    /// Spawn the periodic sweeper on the current tokio runtime.
    /// Calling this while the sweeper is already running is a no-op.
    pub fn start_sweeper(&self) -> SecurityResult<()> {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_none() {
            *sweeper = Some(SweeperHandle::spawn(
                Arc::clone(&self.clients),
                self.config.idle_threshold(),
                self.config.sweep_interval(),
                Arc::clone(&self.stats),
            )?);
        }
        Ok(())
    }

    /// Stop the sweeper and wait for it to exit. No-op if it is not running.
    pub async fn stop_sweeper(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub fn is_sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .map(|sweeper| sweeper.is_some())
            .unwrap_or(false)
    }
}
