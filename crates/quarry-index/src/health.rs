//! Process-wide provider health: circuit breaking on permanent failures and
//! adaptive concurrency on rate limiting.
//!
//! State lives in an explicit registry object so tests (and hosts running
//! several pipelines) can share or reset it deliberately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// How long a waiter sleeps before re-checking, so decayed limits are noticed
/// without a release.
const SLOT_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    /// The failure window elapsed; calls are allowed again.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub rate_limit_threshold: u32,
    pub rate_limit_window: Duration,
    /// Concurrency recommended for a healthy provider.
    pub default_concurrency: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(3600),
            rate_limit_threshold: 3,
            rate_limit_window: Duration::from_secs(60),
            default_concurrency: 8,
        }
    }
}

/// Snapshot of one provider's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderHealth {
    pub failure_count: u32,
    pub last_failure_at: Option<Instant>,
    pub rate_limit_hits: u32,
    pub recommended_concurrency: usize,
    pub state: CircuitState,
}

#[derive(Debug)]
struct Entry {
    failure_count: u32,
    last_failure_at: Option<Instant>,
    rate_limit_hits: Vec<Instant>,
    last_rate_limit_at: Option<Instant>,
    recommended: usize,
    in_flight: usize,
    reported_state: CircuitState,
}

impl Entry {
    fn new(default_concurrency: usize) -> Self {
        Self {
            failure_count: 0,
            last_failure_at: None,
            rate_limit_hits: Vec::new(),
            last_rate_limit_at: None,
            recommended: default_concurrency,
            in_flight: 0,
            reported_state: CircuitState::Closed,
        }
    }

    fn state(&self, config: &HealthConfig, now: Instant) -> CircuitState {
        if self.failure_count < config.failure_threshold {
            return CircuitState::Closed;
        }
        match self.last_failure_at {
            Some(at) if now.duration_since(at) < config.failure_window => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    fn decay(&mut self, config: &HealthConfig, now: Instant) {
        self.rate_limit_hits
            .retain(|at| now.duration_since(*at) < config.rate_limit_window);
        if self.recommended < config.default_concurrency
            && self
                .last_rate_limit_at
                .is_none_or(|at| now.duration_since(at) >= config.rate_limit_window)
        {
            self.recommended = config.default_concurrency;
        }
    }
}

#[derive(Debug)]
pub struct ProviderHealthRegistry {
    config: HealthConfig,
    entries: Mutex<HashMap<String, Entry>>,
    released: Notify,
}

impl ProviderHealthRegistry {
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_entry<T>(&self, provider: &str, f: impl FnOnce(&mut Entry, Instant) -> T) -> T {
        let now = Instant::now();
        let mut entries = self.lock();
        let entry = entries
            .entry(provider.to_owned())
            .or_insert_with(|| Entry::new(self.config.default_concurrency));
        f(entry, now)
    }

    /// Whether calls may be routed to `provider` (breaker closed or half-open).
    #[must_use]
    pub fn is_available(&self, provider: &str) -> bool {
        self.with_entry(provider, |entry, now| {
            let state = entry.state(&self.config, now);
            if state != entry.reported_state {
                if state == CircuitState::HalfOpen {
                    tracing::info!(provider, "circuit half-open, allowing calls");
                }
                entry.reported_state = state;
            }
            state != CircuitState::Open
        })
    }

    #[must_use]
    pub fn circuit_state(&self, provider: &str) -> CircuitState {
        self.with_entry(provider, |entry, now| entry.state(&self.config, now))
    }

    /// Permanent failure (auth, config, model). Counts toward the breaker.
    pub fn record_failure(&self, provider: &str) {
        self.with_entry(provider, |entry, now| {
            match entry.state(&self.config, now) {
                // A failed probe re-opens immediately.
                CircuitState::HalfOpen => entry.failure_count = self.config.failure_threshold,
                _ => {
                    let expired = entry
                        .last_failure_at
                        .is_some_and(|at| now.duration_since(at) >= self.config.failure_window);
                    entry.failure_count = if expired { 1 } else { entry.failure_count + 1 };
                }
            }
            entry.last_failure_at = Some(now);

            if entry.state(&self.config, now) == CircuitState::Open
                && entry.reported_state != CircuitState::Open
            {
                tracing::info!(
                    provider,
                    failures = entry.failure_count,
                    "circuit opened"
                );
                entry.reported_state = CircuitState::Open;
            }
        });
    }

    /// Transient failure that exhausted its retries. Does not touch the
    /// breaker; enough of these in one window halve the recommended
    /// concurrency.
    pub fn record_rate_limit(&self, provider: &str) {
        self.with_entry(provider, |entry, now| {
            entry.decay(&self.config, now);
            entry.rate_limit_hits.push(now);
            entry.last_rate_limit_at = Some(now);
            if entry.rate_limit_hits.len() >= self.config.rate_limit_threshold as usize {
                let halved = (entry.recommended / 2).max(1);
                tracing::warn!(
                    provider,
                    from = entry.recommended,
                    to = halved,
                    "rate limited repeatedly, reducing concurrency"
                );
                entry.recommended = halved;
                entry.rate_limit_hits.clear();
            }
        });
    }

    pub fn record_success(&self, provider: &str) {
        self.with_entry(provider, |entry, _| {
            if entry.failure_count > 0 {
                if entry.reported_state != CircuitState::Closed {
                    tracing::info!(provider, "circuit closed");
                }
                entry.failure_count = 0;
                entry.last_failure_at = None;
                entry.reported_state = CircuitState::Closed;
            }
        });
    }

    #[must_use]
    pub fn recommended_concurrency(&self, provider: &str) -> usize {
        self.with_entry(provider, |entry, now| {
            entry.decay(&self.config, now);
            entry.recommended
        })
    }

    #[must_use]
    pub fn snapshot(&self, provider: &str) -> ProviderHealth {
        self.with_entry(provider, |entry, now| {
            entry.decay(&self.config, now);
            ProviderHealth {
                failure_count: entry.failure_count,
                last_failure_at: entry.last_failure_at,
                rate_limit_hits: u32::try_from(entry.rate_limit_hits.len()).unwrap_or(u32::MAX),
                recommended_concurrency: entry.recommended,
                state: entry.state(&self.config, now),
            }
        })
    }

    /// Forget all provider state.
    pub fn reset(&self) {
        self.lock().clear();
        self.released.notify_waiters();
    }

    /// Wait until `provider` has fewer calls in flight than its recommended
    /// concurrency, then occupy a slot until the returned guard drops.
    pub async fn acquire(self: &Arc<Self>, provider: &str) -> ProviderSlot {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let acquired = self.with_entry(provider, |entry, now| {
                entry.decay(&self.config, now);
                if entry.in_flight < entry.recommended {
                    entry.in_flight += 1;
                    true
                } else {
                    false
                }
            });
            if acquired {
                return ProviderSlot {
                    registry: Arc::clone(self),
                    provider: provider.to_owned(),
                };
            }

            tokio::select! {
                () = &mut released => {}
                () = tokio::time::sleep(SLOT_POLL) => {}
            }
        }
    }
}

impl Default for ProviderHealthRegistry {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

/// Occupied concurrency slot for one provider.
#[derive(Debug)]
pub struct ProviderSlot {
    registry: Arc<ProviderHealthRegistry>,
    provider: String,
}

impl Drop for ProviderSlot {
    fn drop(&mut self) {
        if let Some(entry) = self.registry.lock().get_mut(&self.provider) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
        self.registry.released.notify_waiters();
    }
}
