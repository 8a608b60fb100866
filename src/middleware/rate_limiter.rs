// Per-credential rate limiting with rolling windows
//
// Tracks request counts in a rolling minute window (plus a daily window for
// quota-tiered providers) per credential, decides admissibility, and computes
// wait times. All state lives behind a single mutex so a check and its
// matching record are one atomic step; two in-flight tasks can never both
// pass the check before either one counts.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::middleware::credential_pool::Credential;

/// Fixed rate policy for one provider (or one tier of a provider).
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub requests_per_minute: u32,
    /// Requests per day, for providers with daily quotas.
    pub daily_quota: Option<u32>,
    /// Minimum gap between successive requests on the same credential,
    /// enforced regardless of window state.
    pub min_gap: Option<Duration>,
    /// Slots reserved unused at the top of each window to tolerate clock
    /// skew between us and the provider.
    pub safety_buffer: u32,
    pub window: Duration,
    pub day: Duration,
}

impl RateLimitPolicy {
    /// Simple N-per-minute policy with no daily cap and no minimum gap.
    pub fn fixed(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            daily_quota: None,
            min_gap: None,
            safety_buffer: 0,
            window: Duration::from_secs(60),
            day: Duration::from_secs(24 * 60 * 60),
        }
    }

    fn minute_limit(&self) -> u32 {
        self.requests_per_minute.saturating_sub(self.safety_buffer).max(1)
    }

    fn daily_limit(&self) -> Option<u32> {
        self.daily_quota.map(|q| q.saturating_sub(self.safety_buffer).max(1))
    }
}

/// Rolling counters for one (credential, model-tier) pair. Owned exclusively
/// by the limiter; counters reset to zero exactly when their window elapses,
/// never mid-window.
#[derive(Debug, Clone)]
struct RateWindow {
    count_in_window: u32,
    window_start: Instant,
    count_today: u32,
    day_start: Instant,
    last_request: Option<Instant>,
    /// Set when the provider itself reported a rate limit for this
    /// credential; overrides window headroom until it passes.
    blocked_until: Option<Instant>,
}

impl RateWindow {
    fn fresh(now: Instant) -> Self {
        Self {
            count_in_window: 0,
            window_start: now,
            count_today: 0,
            day_start: now,
            last_request: None,
            blocked_until: None,
        }
    }

    fn roll(&mut self, now: Instant, policy: &RateLimitPolicy) {
        if now.duration_since(self.window_start) >= policy.window {
            self.count_in_window = 0;
            self.window_start = now;
        }
        if now.duration_since(self.day_start) >= policy.day {
            self.count_today = 0;
            self.day_start = now;
        }
        if let Some(until) = self.blocked_until {
            if now >= until {
                self.blocked_until = None;
            }
        }
    }

    fn admissible(&self, now: Instant, policy: &RateLimitPolicy) -> bool {
        if self.blocked_until.is_some_and(|until| now < until) {
            return false;
        }
        if self.count_in_window >= policy.minute_limit() {
            return false;
        }
        if let Some(daily) = policy.daily_limit() {
            if self.count_today >= daily {
                return false;
            }
        }
        if let (Some(gap), Some(last)) = (policy.min_gap, self.last_request) {
            if now.duration_since(last) < gap {
                return false;
            }
        }
        true
    }

    /// Earliest instant at which this window admits a request again.
    fn next_available(&self, now: Instant, policy: &RateLimitPolicy) -> Instant {
        let mut at = now;
        if let Some(until) = self.blocked_until {
            at = at.max(until);
        }
        if self.count_in_window >= policy.minute_limit() {
            at = at.max(self.window_start + policy.window);
        }
        if let Some(daily) = policy.daily_limit() {
            if self.count_today >= daily {
                at = at.max(self.day_start + policy.day);
            }
        }
        if let (Some(gap), Some(last)) = (policy.min_gap, self.last_request) {
            at = at.max(last + gap);
        }
        at
    }

    fn headroom(&self, policy: &RateLimitPolicy) -> u32 {
        policy.minute_limit().saturating_sub(self.count_in_window)
    }
}

type WindowKey = (String, Option<String>);

/// The credential the limiter picked, with how long to wait before it (or
/// anything) becomes admissible. `wait` is zero when the pick was admitted.
#[derive(Debug, Clone)]
pub enum Acquire {
    /// Admission granted and recorded for this credential.
    Granted { credential_id: String },
    /// Nothing admissible; soonest credential becomes available after `wait`.
    Wait { credential_id: String, wait: Duration },
}

pub struct RateLimiter {
    base: RateLimitPolicy,
    /// Policy applied to `:free`-suffixed models on tiered providers.
    free_tier: Option<RateLimitPolicy>,
    windows: Mutex<HashMap<WindowKey, RateWindow>>,
}

impl RateLimiter {
    pub fn new(base: RateLimitPolicy) -> Self {
        Self {
            base,
            free_tier: None,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Limiter for a provider whose `:free` models carry their own quota
    /// rules. Windows are then keyed per model as well as per credential.
    pub fn tiered(base: RateLimitPolicy, free_tier: RateLimitPolicy) -> Self {
        Self {
            base,
            free_tier: Some(free_tier),
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn policy_for(&self, model: Option<&str>) -> &RateLimitPolicy {
        match (&self.free_tier, model) {
            (Some(free), Some(m)) if m.ends_with(":free") => free,
            _ => &self.base,
        }
    }

    fn key(&self, credential_id: &str, model: Option<&str>) -> WindowKey {
        // Per-model windows only matter where quotas differ per model tier.
        let model_key = if self.free_tier.is_some() {
            model.map(str::to_string)
        } else {
            None
        };
        (credential_id.to_string(), model_key)
    }

    /// Whether a request on this credential is admissible right now.
    /// A credential with no prior activity gets a fresh window starting now.
    pub fn can_proceed(&self, credential_id: &str, model: Option<&str>) -> bool {
        let now = Instant::now();
        let policy = self.policy_for(model).clone();
        let mut windows = self.windows.lock();
        let window = windows
            .entry(self.key(credential_id, model))
            .or_insert_with(|| RateWindow::fresh(now));
        window.roll(now, &policy);
        window.admissible(now, &policy)
    }

    /// Count one attempted request. Must be called exactly once per attempt;
    /// the orchestrator only reaches this through `admit`/`acquire` so the
    /// check and the count are a single step.
    pub fn record(&self, credential_id: &str, model: Option<&str>) {
        let now = Instant::now();
        let policy = self.policy_for(model).clone();
        let mut windows = self.windows.lock();
        let window = windows
            .entry(self.key(credential_id, model))
            .or_insert_with(|| RateWindow::fresh(now));
        window.roll(now, &policy);
        window.count_in_window += 1;
        window.count_today += 1;
        window.last_request = Some(now);
    }

    /// Check-then-record under one lock. Returns false without counting when
    /// the credential is not admissible.
    pub fn admit(&self, credential_id: &str, model: Option<&str>) -> bool {
        let now = Instant::now();
        let policy = self.policy_for(model).clone();
        let mut windows = self.windows.lock();
        let window = windows
            .entry(self.key(credential_id, model))
            .or_insert_with(|| RateWindow::fresh(now));
        window.roll(now, &policy);
        if !window.admissible(now, &policy) {
            return false;
        }
        window.count_in_window += 1;
        window.count_today += 1;
        window.last_request = Some(now);
        true
    }

    /// Time until this credential admits a request; zero if it already does.
    pub fn wait_time(&self, credential_id: &str, model: Option<&str>) -> Duration {
        let now = Instant::now();
        let policy = self.policy_for(model).clone();
        let mut windows = self.windows.lock();
        let window = windows
            .entry(self.key(credential_id, model))
            .or_insert_with(|| RateWindow::fresh(now));
        window.roll(now, &policy);
        window.next_available(now, &policy).saturating_duration_since(now)
    }

    /// Minimum wait until ANY of the credentials becomes admissible; zero if
    /// at least one already is.
    pub fn wait_time_across(&self, credential_ids: &[String], model: Option<&str>) -> Duration {
        credential_ids
            .iter()
            .map(|id| self.wait_time(id, model))
            .min()
            .unwrap_or(Duration::ZERO)
    }

    /// Among admissible credentials, pick the one with the most remaining
    /// window headroom (tie-broken by least usage today) and record the
    /// admission. If none is admissible, name the soonest-available
    /// credential and how long until then. When another admissible
    /// credential exists, `avoid` is skipped (retry rotation).
    pub fn acquire(
        &self,
        credentials: &[Credential],
        model: Option<&str>,
        avoid: Option<&str>,
    ) -> Option<Acquire> {
        let now = Instant::now();
        let policy = self.policy_for(model).clone();
        let mut windows = self.windows.lock();

        let mut best: Option<(usize, u32, u32)> = None; // (idx, headroom, count_today)
        let mut soonest: Option<(usize, Instant)> = None;

        for (idx, credential) in credentials.iter().enumerate() {
            let window = windows
                .entry(self.key(&credential.id, model))
                .or_insert_with(|| RateWindow::fresh(now));
            window.roll(now, &policy);

            if window.admissible(now, &policy) {
                let headroom = window.headroom(&policy);
                let today = window.count_today;
                let better = match best {
                    None => true,
                    Some((best_idx, best_headroom, best_today)) => {
                        // Prefer non-avoided credentials outright.
                        let best_avoided = avoid == Some(credentials[best_idx].id.as_str());
                        let this_avoided = avoid == Some(credential.id.as_str());
                        if best_avoided != this_avoided {
                            best_avoided
                        } else {
                            headroom > best_headroom
                                || (headroom == best_headroom && today < best_today)
                        }
                    }
                };
                if better {
                    best = Some((idx, headroom, today));
                }
            } else {
                let at = window.next_available(now, &policy);
                if soonest.map_or(true, |(_, s)| at < s) {
                    soonest = Some((idx, at));
                }
            }
        }

        if let Some((idx, _, _)) = best {
            let id = credentials[idx].id.clone();
            if let Some(window) = windows.get_mut(&self.key(&id, model)) {
                window.count_in_window += 1;
                window.count_today += 1;
                window.last_request = Some(now);
            }
            return Some(Acquire::Granted { credential_id: id });
        }

        soonest.map(|(idx, at)| Acquire::Wait {
            credential_id: credentials[idx].id.clone(),
            wait: at.saturating_duration_since(now),
        })
    }

    /// The provider reported a rate limit on this credential: block it for
    /// `wait` so other tasks route around it.
    pub fn penalize(&self, credential_id: &str, model: Option<&str>, wait: Duration) {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows
            .entry(self.key(credential_id, model))
            .or_insert_with(|| RateWindow::fresh(now));
        window.blocked_until = Some(now + wait);
        debug!("Credential {} blocked for {:?}", credential_id, wait);
    }

    /// Drop all window state for a removed credential so a later re-add
    /// starts fresh.
    pub fn reset(&self, credential_id: &str) {
        self.windows.lock().retain(|(id, _), _| id != credential_id);
    }

    /// Requests recorded in the current minute window across all credentials.
    pub fn current_minute_count(&self) -> u32 {
        let now = Instant::now();
        let base = self.base.clone();
        let free = self.free_tier.clone();
        let mut windows = self.windows.lock();
        windows
            .iter_mut()
            .map(|((_, model_key), window)| {
                let policy = match (&free, model_key) {
                    (Some(f), Some(m)) if m.ends_with(":free") => f,
                    _ => &base,
                };
                window.roll(now, policy);
                window.count_in_window
            })
            .sum()
    }
}
