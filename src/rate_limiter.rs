//! Token-bucket and sliding-window rate limiting, per-subject quota state,
//! burst and priority policies, and IP bans (spec §4.3).
//!
//! Grounded in `examples/original_source/src/rate_limiter.cpp`: the sliding
//! window is a deque of timestamps trimmed from the front on every access,
//! burst is a secondary count over a shorter trailing window, and the token
//! bucket refills in whole quantized intervals rather than continuously.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::RateLimitError;

/// One of the eight limit dimensions named in spec §3, matching
/// `original_source/include/rate_limiter.h`'s `LimitType` one-for-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    RequestsPerSecond,
    RequestsPerMinute,
    RequestsPerHour,
    RequestsPerDay,
    ConcurrentJobs,
    MemoryUsage,
    GpuUsage,
    Bandwidth,
}

impl LimitKind {
    /// Reservation kinds hold capacity for the duration of a job rather than
    /// merely counting events per window (spec GLOSSARY: "Reservation kind").
    pub fn is_reservation(self) -> bool {
        matches!(
            self,
            LimitKind::MemoryUsage | LimitKind::GpuUsage | LimitKind::ConcurrentJobs
        )
    }
}

/// Configuration for one limit dimension on a subject.
#[derive(Debug, Clone)]
pub struct RateLimit {
    pub kind: LimitKind,
    pub limit: u64,
    pub window: Duration,
    pub burst_limit: u64,
    pub burst_window: Duration,
}

impl RateLimit {
    pub fn new(kind: LimitKind, limit: u64, window: Duration) -> Self {
        Self {
            kind,
            limit,
            window,
            burst_limit: 0,
            burst_window: Duration::from_secs(5),
        }
    }

    pub fn with_burst(mut self, burst_limit: u64, burst_window: Duration) -> Self {
        self.burst_limit = burst_limit;
        self.burst_window = burst_window;
        self
    }
}

/// A usage snapshot for one (subject, kind) pair, as described in spec §3.
#[derive(Debug, Clone, Default)]
pub struct QuotaUsage {
    pub current: u64,
    pub capacity: u64,
    pub reset_in: Duration,
    pub utilization: f64,
}

/// A subject's full quota configuration: one `RateLimit` per dimension, a
/// priority level, and a premium flag.
#[derive(Debug, Clone, Default)]
pub struct SubjectQuota {
    pub limits: Vec<RateLimit>,
    pub priority: i32,
    pub premium: bool,
}

impl SubjectQuota {
    fn find(&self, kind: LimitKind) -> Option<&RateLimit> {
        self.limits.iter().find(|l| l.kind == kind)
    }

    fn find_mut(&mut self, kind: LimitKind) -> Option<&mut RateLimit> {
        self.limits.iter_mut().find(|l| l.kind == kind)
    }
}

fn default_limit(kind: LimitKind) -> RateLimit {
    RateLimit::new(kind, 100, Duration::from_secs(60))
}

struct SubjectState {
    quota: SubjectQuota,
    windows: HashMap<LimitKind, VecDeque<Instant>>,
    held: HashMap<LimitKind, u64>,
    active_jobs: HashSet<String>,
    last_cleanup: Instant,
}

impl SubjectState {
    fn new() -> Self {
        Self {
            quota: SubjectQuota::default(),
            windows: HashMap::new(),
            held: HashMap::new(),
            active_jobs: HashSet::new(),
            last_cleanup: Instant::now(),
        }
    }

    fn rate_limit(&self, kind: LimitKind) -> RateLimit {
        self.quota
            .find(kind)
            .cloned()
            .unwrap_or_else(|| default_limit(kind))
    }

    /// Trim entries outside `window` from the front of the deque.
    fn trim(window: &mut VecDeque<Instant>, window_size: Duration, now: Instant) {
        while let Some(&front) = window.front() {
            if front + window_size < now {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admission check per spec §4.3 "sliding window" + "burst allowance".
    /// Does not mutate.
    fn check(&self, kind: LimitKind, amount: u64, now: Instant) -> bool {
        let rl = self.rate_limit(kind);
        let mut window = self
            .windows
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        Self::trim(&mut window, rl.window, now);

        if (window.len() as u64) + amount <= rl.limit {
            return true;
        }

        if rl.burst_limit > 0 {
            let burst_start = now.checked_sub(rl.burst_window).unwrap_or(now);
            let in_burst = window.iter().filter(|&&t| t >= burst_start).count() as u64;
            if in_burst + amount <= rl.burst_limit {
                return true;
            }
        }

        false
    }

    /// `retry_after` for a denied request: time until the oldest in-window
    /// entry falls out of the window.
    fn retry_after(&self, kind: LimitKind, now: Instant) -> Duration {
        let rl = self.rate_limit(kind);
        match self.windows.get(&kind).and_then(|w| w.front()) {
            Some(&front) => (front + rl.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    fn record(&mut self, kind: LimitKind, amount: u64, now: Instant) {
        let rl = self.rate_limit(kind);
        let window = self.windows.entry(kind).or_default();
        for _ in 0..amount {
            window.push_back(now);
        }
        Self::trim(window, rl.window, now);
    }

    fn usage(&self, kind: LimitKind, now: Instant) -> QuotaUsage {
        let rl = self.rate_limit(kind);
        let current = self
            .windows
            .get(&kind)
            .map(|w| w.len() as u64)
            .unwrap_or(0);
        let reset_in = self.retry_after(kind, now);
        let utilization = if rl.limit > 0 {
            current as f64 / rl.limit as f64
        } else {
            0.0
        };
        QuotaUsage {
            current,
            capacity: rl.limit,
            reset_in,
            utilization,
        }
    }

    fn cleanup(&mut self, now: Instant) {
        let quota = self.quota.clone();
        for (kind, window) in self.windows.iter_mut() {
            let rl = quota.find(*kind).cloned().unwrap_or_else(|| default_limit(*kind));
            Self::trim(window, rl.window, now);
        }
        self.last_cleanup = now;
    }

    fn is_idle(&self) -> bool {
        self.windows.values().all(|w| w.is_empty()) && self.active_jobs.is_empty()
    }
}

const CLEANUP_CADENCE: Duration = Duration::from_secs(5 * 60);

/// A token bucket, per spec §4.3 "Token bucket (alternative smoother)".
/// Refills in whole quantized intervals, matching
/// `original_source/src/rate_limiter.cpp::TokenBucket::Impl::refillTokens`.
pub struct TokenBucket {
    capacity: u64,
    refill_rate: u64,
    refill_interval: Duration,
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_rate: u64, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_rate,
            refill_interval,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed >= self.refill_interval && !self.refill_interval.is_zero() {
            let intervals = elapsed.as_nanos() / self.refill_interval.as_nanos().max(1);
            let added = intervals as u64 * self.refill_rate;
            self.tokens = self.capacity.min(self.tokens + added);
            self.last_refill = now;
        }
    }

    pub fn consume(&mut self, tokens: u64) -> bool {
        self.refill(Instant::now());
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self) -> u64 {
        self.refill(Instant::now());
        self.tokens
    }

    pub fn reset(&mut self) {
        self.tokens = self.capacity;
        self.last_refill = Instant::now();
    }
}

/// The Rate / Quota Engine (spec §4.3). Owns all subject state under its
/// own lock; callers never see the internal map.
pub struct RateEngine {
    subjects: RwLock<HashMap<String, SubjectState>>,
    bans: RwLock<HashMap<String, Instant>>,
}

impl Default for RateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RateEngine {
    pub fn new() -> Self {
        Self {
            subjects: RwLock::new(HashMap::new()),
            bans: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set_quota(&self, subject: &str, quota: SubjectQuota) {
        let mut subjects = self.subjects.write().await;
        let entry = subjects
            .entry(subject.to_string())
            .or_insert_with(SubjectState::new);
        entry.quota = quota;
    }

    pub async fn update_limit(&self, subject: &str, kind: LimitKind, new_value: u64) {
        let mut subjects = self.subjects.write().await;
        let entry = subjects
            .entry(subject.to_string())
            .or_insert_with(SubjectState::new);
        match entry.quota.find_mut(kind) {
            Some(rl) => rl.limit = new_value,
            None => entry
                .quota
                .limits
                .push(RateLimit::new(kind, new_value, Duration::from_secs(60))),
        }
    }

    pub async fn check(&self, subject: &str, kind: LimitKind, amount: u64) -> bool {
        let subjects = self.subjects.read().await;
        match subjects.get(subject) {
            Some(state) => state.check(kind, amount, Instant::now()),
            None => true,
        }
    }

    pub async fn record(&self, subject: &str, kind: LimitKind, amount: u64) {
        let mut subjects = self.subjects.write().await;
        let now = Instant::now();
        let entry = subjects
            .entry(subject.to_string())
            .or_insert_with(SubjectState::new);
        entry.record(kind, amount, now);

        if now.saturating_duration_since(entry.last_cleanup) > CLEANUP_CADENCE {
            entry.cleanup(now);
        }
    }

    /// `check` then `record` atomically; increments the held-reservation
    /// counter for reservation kinds. Spec §4.3 `acquire`.
    pub async fn acquire(
        &self,
        subject: &str,
        kind: LimitKind,
        amount: u64,
    ) -> Result<(), RateLimitError> {
        if self.is_banned(subject).await {
            return Err(RateLimitError::Banned);
        }

        let mut subjects = self.subjects.write().await;
        let now = Instant::now();
        let entry = subjects
            .entry(subject.to_string())
            .or_insert_with(SubjectState::new);

        if !entry.check(kind, amount, now) {
            let retry_after = entry.retry_after(kind, now);
            return Err(RateLimitError::Exceeded { kind, retry_after });
        }

        entry.record(kind, amount, now);
        if kind.is_reservation() {
            *entry.held.entry(kind).or_insert(0) += amount;
        }

        if now.saturating_duration_since(entry.last_cleanup) > CLEANUP_CADENCE {
            entry.cleanup(now);
        }

        Ok(())
    }

    /// Decrement the held-reservation counter, clamped at zero. Never
    /// reverses recorded window consumption (spec §4.3: "recorded
    /// consumption is never retroactively reversed except by explicit
    /// release").
    pub async fn release(&self, subject: &str, kind: LimitKind, amount: u64) {
        let mut subjects = self.subjects.write().await;
        let entry = subjects
            .entry(subject.to_string())
            .or_insert_with(SubjectState::new);
        let held = entry.held.entry(kind).or_insert(0);
        *held = held.saturating_sub(amount);
    }

    pub async fn mark_job_started(&self, subject: &str, job_id: &str) {
        let mut subjects = self.subjects.write().await;
        let entry = subjects
            .entry(subject.to_string())
            .or_insert_with(SubjectState::new);
        entry.active_jobs.insert(job_id.to_string());
    }

    pub async fn mark_job_completed(&self, subject: &str, job_id: &str) {
        let mut subjects = self.subjects.write().await;
        if let Some(entry) = subjects.get_mut(subject) {
            entry.active_jobs.remove(job_id);
        }
    }

    pub async fn current_concurrent(&self, subject: &str) -> usize {
        let subjects = self.subjects.read().await;
        subjects
            .get(subject)
            .map(|s| s.active_jobs.len())
            .unwrap_or(0)
    }

    /// Admission path with the spec §4.3 "priority over-limit" rule: subjects
    /// with `priority > 5` get a `1.2x` admission cap instead of `limit`.
    /// Standard `check` is unaffected by priority.
    pub async fn check_with_priority(&self, subject: &str, kind: LimitKind, amount: u64) -> bool {
        let subjects = self.subjects.read().await;
        let Some(state) = subjects.get(subject) else {
            return true;
        };

        if state.quota.priority > 5 {
            let rl = state.rate_limit(kind);
            let extended = (rl.limit as f64 * 1.2) as u64;
            let current = state
                .windows
                .get(&kind)
                .map(|w| w.len() as u64)
                .unwrap_or(0);
            return current + amount <= extended;
        }

        state.check(kind, amount, Instant::now())
    }

    pub async fn usage(&self, subject: &str, kind: LimitKind) -> QuotaUsage {
        let subjects = self.subjects.read().await;
        subjects
            .get(subject)
            .map(|s| s.usage(kind, Instant::now()))
            .unwrap_or_default()
    }

    pub async fn top_consumers(&self, kind: LimitKind, n: usize) -> Vec<(String, u64)> {
        let subjects = self.subjects.read().await;
        let now = Instant::now();
        let mut consumers: Vec<(String, u64)> = subjects
            .iter()
            .map(|(id, state)| (id.clone(), state.usage(kind, now).current))
            .collect();
        consumers.sort_by_key(|b| std::cmp::Reverse(b.1));
        consumers.truncate(n);
        consumers
    }

    pub async fn global_usage_stats(&self) -> HashMap<LimitKind, u64> {
        let subjects = self.subjects.read().await;
        let now = Instant::now();
        let mut stats = HashMap::new();
        for state in subjects.values() {
            for kind in [
                LimitKind::RequestsPerSecond,
                LimitKind::RequestsPerMinute,
                LimitKind::RequestsPerHour,
                LimitKind::RequestsPerDay,
                LimitKind::ConcurrentJobs,
                LimitKind::MemoryUsage,
                LimitKind::GpuUsage,
                LimitKind::Bandwidth,
            ] {
                *stats.entry(kind).or_insert(0) += state.usage(kind, now).current;
            }
        }
        stats
    }

    /// Rough resident footprint, matching the spirit of
    /// `original_source`'s `RateLimiter::getMemoryUsage` (used for capacity
    /// planning, not a precise accounting).
    pub async fn memory_footprint(&self) -> usize {
        let subjects = self.subjects.read().await;
        subjects
            .values()
            .map(|s| {
                s.windows.values().map(VecDeque::len).sum::<usize>()
                    * std::mem::size_of::<Instant>()
            })
            .sum()
    }

    pub async fn ban(&self, subject: &str, duration: Duration) {
        let mut bans = self.bans.write().await;
        bans.insert(subject.to_string(), Instant::now() + duration);
    }

    pub async fn unban(&self, subject: &str) {
        let mut bans = self.bans.write().await;
        bans.remove(subject);
    }

    /// A ban entry with expiry `t` denies admission iff `now < t`; expired
    /// bans are lazily removed on lookup (spec §3 invariant).
    pub async fn is_banned(&self, subject: &str) -> bool {
        let now = Instant::now();
        {
            let bans = self.bans.read().await;
            match bans.get(subject) {
                Some(&expiry) if expiry > now => return true,
                Some(_) => {}
                None => return false,
            }
        }
        let mut bans = self.bans.write().await;
        if matches!(bans.get(subject), Some(&expiry) if expiry <= now) {
            bans.remove(subject);
        }
        false
    }

    /// Periodic + opportunistic maintenance pass (spec §4.3 "Maintenance"):
    /// trims every subject's windows, drops idle subjects, and removes
    /// expired bans.
    pub async fn cleanup(&self) {
        let now = Instant::now();
        {
            let mut subjects = self.subjects.write().await;
            subjects.retain(|_, state| {
                state.cleanup(now);
                !state.is_idle()
            });
        }
        {
            let mut bans = self.bans.write().await;
            bans.retain(|_, &mut expiry| expiry > now);
        }
    }
}

/// A narrower facade restricted to IP + CPU-seconds quotas, matching the
/// "two distinct rate-limiter interfaces" note in spec §9: one engine, two
/// front doors, sharing the same underlying subject-state map via `engine`.
pub struct IpLimiter<'a> {
    engine: &'a RateEngine,
}

impl<'a> IpLimiter<'a> {
    pub fn new(engine: &'a RateEngine) -> Self {
        Self { engine }
    }

    pub async fn check(&self, ip: &str, amount: u64) -> bool {
        self.engine.check(ip, LimitKind::RequestsPerHour, amount).await
    }

    pub async fn acquire(&self, ip: &str, amount: u64) -> Result<(), RateLimitError> {
        self.engine.acquire(ip, LimitKind::RequestsPerHour, amount).await
    }

    pub async fn ban(&self, ip: &str, duration: Duration) {
        self.engine.ban(ip, duration).await;
    }

    pub async fn is_banned(&self, ip: &str) -> bool {
        self.engine.is_banned(ip).await
    }
}
