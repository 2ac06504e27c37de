//! Two-tier rate limit coordinator.
//!
//! Every admission check goes through [`RateLimiter::check_and_consume`]:
//!
//! 1. A live local entry that has already reached the limit denies the call
//!    without a store round trip.
//! 2. Otherwise the shared store increments the subject's window counter and
//!    the local entry is overwritten with the store's figures.
//! 3. If the store cannot be reached, the local entry counts the request on
//!    its own and the decision is made from that count alone.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backend::CounterStore;
use super::cache::LocalCache;
use super::subject::{validate_limit, Subject};
use crate::error::Result;
use crate::store::StoreError;

/// Default prefix for store keys.
const DEFAULT_KEY_PREFIX: &str = "rate_limit";

/// Which tier produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    /// Denied by an exhausted local entry, store not contacted
    Cache,
    /// Counted by the shared store
    Store,
    /// Counted locally because the store was unreachable
    Degraded,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Limit the request was checked against
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// Time until the window resets
    #[serde(rename = "reset_in_ms", serialize_with = "serialize_millis")]
    pub reset_in: Duration,
    /// Tier that produced the decision
    pub source: DecisionSource,
}

impl Decision {
    fn from_count(count: u64, limit: u64, reset_in: Duration, source: DecisionSource) -> Self {
        Self {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_in,
            source,
        }
    }

    fn exhausted(limit: u64, reset_in: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_in,
            source: DecisionSource::Cache,
        }
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// The rate limit coordinator.
///
/// This struct is thread-safe and can be shared across multiple tasks. The
/// store and the local cache are reconciled per call and never locked
/// together.
pub struct RateLimiter {
    /// Distinguishes this instance in logs; degraded counting is per instance
    instance_id: String,
    store: Arc<dyn CounterStore>,
    cache: Arc<LocalCache>,
    key_prefix: String,
    window: Duration,
    degraded: AtomicBool,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("instance_id", &self.instance_id)
            .field("store", &self.store.name())
            .field("key_prefix", &self.key_prefix)
            .field("window", &self.window)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl RateLimiter {
    /// Create a coordinator over `store` and `cache` with a fixed `window`.
    ///
    /// `window` must be non-zero; with a zero window every check fails with
    /// [`TierlimitError::Invariant`](crate::error::TierlimitError::Invariant).
    pub fn new(store: Arc<dyn CounterStore>, cache: Arc<LocalCache>, window: Duration) -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            store,
            cache,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            window,
            degraded: AtomicBool::new(false),
        }
    }

    /// Use `prefix` for store keys instead of the default.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Check whether `subject` may make one more request under `limit`, and
    /// count it.
    ///
    /// Fails only on an empty subject or zero limit (before any state is
    /// touched) or when the local cache refuses an update. Store failures are
    /// absorbed by counting locally.
    pub async fn check_and_consume(&self, subject: &str, limit: u64) -> Result<Decision> {
        let subject = Subject::parse(subject)?;
        let limit = validate_limit(limit)?;
        let now = self.cache.clock().now();

        if let Some(snapshot) = self.cache.get(subject.as_str()) {
            if snapshot.is_exhausted(limit) {
                let decision = Decision::exhausted(limit, snapshot.reset_in(now));
                debug!(
                    subject = %subject,
                    limit,
                    count = snapshot.count,
                    "Rate limit exhausted in local cache"
                );
                return Ok(decision);
            }
        }

        let key = subject.store_key(&self.key_prefix);
        let decision = match self.store.increment_and_get(&key, self.window).await {
            Ok(window) => {
                self.mark_recovered();
                self.cache
                    .upsert(subject.as_str(), window.count, limit, window.ttl)?;
                Decision::from_count(window.count, limit, window.ttl, DecisionSource::Store)
            }
            Err(e) => {
                self.mark_degraded(&e);
                let snapshot = self
                    .cache
                    .increment_or_reset(subject.as_str(), limit, self.window)?;
                let reset_in = snapshot.reset_in(self.cache.clock().now());
                Decision::from_count(snapshot.count, limit, reset_in, DecisionSource::Degraded)
            }
        };

        debug!(
            subject = %subject,
            limit,
            remaining = decision.remaining,
            allowed = decision.allowed,
            source = ?decision.source,
            "Rate limit decision made"
        );
        Ok(decision)
    }

    /// Whether the last store call failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Identifier of this coordinator instance.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The local cache tier.
    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    fn mark_degraded(&self, error: &StoreError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(
                instance_id = %self.instance_id,
                store = self.store.name(),
                error = %error,
                "Counter store unreachable, switching to local-only counting"
            );
        } else {
            debug!(error = %error, "Counter store still unreachable");
        }
    }

    fn mark_recovered(&self) {
        if self.degraded.load(Ordering::Acquire) && self.degraded.swap(false, Ordering::AcqRel) {
            info!(
                instance_id = %self.instance_id,
                store = self.store.name(),
                "Counter store reachable again, leaving degraded mode"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TierlimitError;
    use crate::ratelimit::backend::WindowCount;
    use crate::ratelimit::clock::MockClock;
    use crate::store::InMemoryCounterStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    const WINDOW: Duration = Duration::from_secs(60);

    /// When the injected failure happens relative to the backend write.
    #[derive(Debug, Clone, Copy)]
    enum FailurePoint {
        /// Request never reaches the backend
        BeforeApply,
        /// Backend counts the request but the reply is lost
        AfterApply,
    }

    #[derive(Debug)]
    enum Failures {
        None,
        Always,
        OnCalls(HashSet<usize>),
        /// Count the request but answer with an already-closed window
        ClosedWindowOnCalls(HashSet<usize>),
    }

    /// In-memory store with scripted failures.
    #[derive(Debug)]
    struct FlakyStore {
        inner: InMemoryCounterStore,
        calls: AtomicUsize,
        failures: Mutex<Failures>,
        point: FailurePoint,
    }

    impl FlakyStore {
        fn new(clock: &MockClock, point: FailurePoint) -> Self {
            Self {
                inner: InMemoryCounterStore::new(Arc::new(clock.clone())),
                calls: AtomicUsize::new(0),
                failures: Mutex::new(Failures::None),
                point,
            }
        }

        fn set_failures(&self, failures: Failures) {
            *self.failures.lock() = failures;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        async fn increment_and_get(&self, key: &str, window: Duration) -> std::result::Result<WindowCount, StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let (fail, closed_window) = match &*self.failures.lock() {
                Failures::None => (false, false),
                Failures::Always => (true, false),
                Failures::OnCalls(calls) => (calls.contains(&call), false),
                Failures::ClosedWindowOnCalls(calls) => (false, calls.contains(&call)),
            };

            if closed_window {
                let counted = self.inner.increment_and_get(key, window).await?;
                return Ok(WindowCount {
                    ttl: Duration::ZERO,
                    ..counted
                });
            }

            if !fail {
                return self.inner.increment_and_get(key, window).await;
            }
            if let FailurePoint::AfterApply = self.point {
                self.inner.increment_and_get(key, window).await?;
            }
            Err(StoreError::Timeout(Duration::from_millis(100)))
        }

        async fn ping(&self) -> std::result::Result<Duration, StoreError> {
            Ok(Duration::ZERO)
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    struct Harness {
        start: Instant,
        clock: MockClock,
        store: Arc<FlakyStore>,
        limiter: RateLimiter,
    }

    impl Harness {
        /// Place the clock `secs` seconds after the harness was built.
        fn at(&self, secs: u64) {
            self.clock.set(self.start + Duration::from_secs(secs));
        }
    }

    fn harness(point: FailurePoint) -> Harness {
        harness_with_window(point, WINDOW)
    }

    fn harness_with_window(point: FailurePoint, window: Duration) -> Harness {
        let start = Instant::now();
        let clock = MockClock::new(start);
        let store = Arc::new(FlakyStore::new(&clock, point));
        let cache = Arc::new(LocalCache::new(Arc::new(clock.clone())));
        let limiter = RateLimiter::new(store.clone(), cache, window);
        Harness {
            start,
            clock,
            store,
            limiter,
        }
    }

    #[tokio::test]
    async fn test_limit_plus_one_is_denied() {
        let h = harness(FailurePoint::BeforeApply);

        for expected_remaining in (0..5).rev() {
            let decision = assert_ok!(h.limiter.check_and_consume("alice", 5).await);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.source, DecisionSource::Store);
        }

        let decision = assert_ok!(h.limiter.check_and_consume("alice", 5).await);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_exhausted_subject_skips_store() {
        let h = harness(FailurePoint::BeforeApply);

        for _ in 0..3 {
            h.limiter.check_and_consume("alice", 3).await.unwrap();
        }
        for _ in 0..5 {
            let decision = h.limiter.check_and_consume("alice", 3).await.unwrap();
            assert!(!decision.allowed);
            assert_eq!(decision.source, DecisionSource::Cache);
        }

        assert_eq!(h.store.calls(), 3);
        assert_eq!(h.store.inner.get("rate_limit:alice"), Some(3));
    }

    #[tokio::test]
    async fn test_fixed_window_scenario() {
        let h = harness(FailurePoint::BeforeApply);

        for (t, remaining) in [(0, 2), (1, 1), (2, 0)] {
            h.at(t);
            let decision = h.limiter.check_and_consume("alice", 3).await.unwrap();
            assert!(decision.allowed, "call at t={t} should be allowed");
            assert_eq!(decision.remaining, remaining);
            assert_eq!(decision.reset_in, Duration::from_secs(60 - t));
        }

        h.at(3);
        let decision = h.limiter.check_and_consume("alice", 3).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_in, Duration::from_secs(57));

        h.at(61);
        let decision = h.limiter.check_and_consume("alice", 3).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.reset_in, WINDOW);
    }

    #[tokio::test]
    async fn test_remaining_never_increases_within_window() {
        let h = harness(FailurePoint::BeforeApply);
        let mut last = u64::MAX;

        for _ in 0..10 {
            h.clock.advance(Duration::from_secs(1));
            let decision = h.limiter.check_and_consume("alice", 4).await.unwrap();
            assert!(decision.remaining <= last);
            last = decision.remaining;
        }
        assert_eq!(last, 0);
    }

    #[tokio::test]
    async fn test_invalid_input_touches_nothing() {
        let h = harness(FailurePoint::BeforeApply);

        let err = assert_err!(h.limiter.check_and_consume("", 5).await);
        assert!(matches!(err, TierlimitError::Validation(_)));

        let err = assert_err!(h.limiter.check_and_consume("alice", 0).await);
        assert!(matches!(err, TierlimitError::Validation(_)));

        assert_eq!(h.store.calls(), 0);
        assert!(h.store.inner.is_empty());
        assert!(h.limiter.cache().is_empty());
    }

    #[tokio::test]
    async fn test_store_success_overwrites_local_count() {
        let h = harness(FailurePoint::BeforeApply);

        for expected in 1..=3u64 {
            h.limiter.check_and_consume("alice", 10).await.unwrap();
            let local = h.limiter.cache().get("alice").unwrap();
            // Exactly the store's figure, never the store's figure plus one
            assert_eq!(local.count, expected);
            assert_eq!(h.store.inner.get("rate_limit:alice"), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_permanent_outage_still_enforces_limit() {
        let h = harness(FailurePoint::BeforeApply);
        h.store.set_failures(Failures::Always);

        for expected_remaining in (0..4).rev() {
            let decision = h.limiter.check_and_consume("alice", 4).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.source, DecisionSource::Degraded);
        }

        let decision = h.limiter.check_and_consume("alice", 4).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(h.limiter.is_degraded());
    }

    #[tokio::test]
    async fn test_degraded_window_rolls_over() {
        let h = harness(FailurePoint::BeforeApply);
        h.store.set_failures(Failures::Always);

        for _ in 0..3 {
            h.limiter.check_and_consume("alice", 2).await.unwrap();
        }
        h.clock.advance(WINDOW);

        let decision = h.limiter.check_and_consume("alice", 2).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.reset_in, WINDOW);
    }

    #[tokio::test]
    async fn test_recovery_replaces_local_count_with_store_count() {
        let h = harness(FailurePoint::BeforeApply);
        h.store.set_failures(Failures::Always);

        for _ in 0..3 {
            h.limiter.check_and_consume("alice", 10).await.unwrap();
        }
        assert_eq!(h.limiter.cache().get("alice").unwrap().count, 3);

        h.store.set_failures(Failures::None);
        let decision = h.limiter.check_and_consume("alice", 10).await.unwrap();

        // The store only saw this one request
        assert_eq!(decision.source, DecisionSource::Store);
        assert_eq!(decision.remaining, 9);
        assert_eq!(h.limiter.cache().get("alice").unwrap().count, 1);
        assert!(!h.limiter.is_degraded());

        let decision = h.limiter.check_and_consume("alice", 10).await.unwrap();
        let store_count = h.store.inner.get("rate_limit:alice").unwrap();
        assert_eq!(decision.remaining, 10 - store_count);
    }

    #[tokio::test]
    async fn test_outage_mid_sequence_still_caps() {
        let h = harness(FailurePoint::AfterApply);
        h.store.set_failures(Failures::OnCalls(HashSet::from([2, 3])));

        let mut decisions = Vec::new();
        for _ in 0..6 {
            decisions.push(h.limiter.check_and_consume("alice", 5).await.unwrap());
        }

        assert_eq!(decisions[1].source, DecisionSource::Degraded);
        assert_eq!(decisions[2].source, DecisionSource::Degraded);
        assert!(decisions[..5].iter().all(|d| d.allowed));
        assert!(!decisions[5].allowed);
        assert_eq!(decisions[5].remaining, 0);
    }

    #[tokio::test]
    async fn test_closed_window_reply_fails_only_that_call() {
        let h = harness(FailurePoint::BeforeApply);
        h.store.set_failures(Failures::ClosedWindowOnCalls(HashSet::from([2])));

        assert_ok!(h.limiter.check_and_consume("alice", 5).await);

        let err = assert_err!(h.limiter.check_and_consume("alice", 5).await);
        assert!(matches!(err, TierlimitError::Invariant(_)));
        assert!(!h.limiter.is_degraded());

        // The coordinator keeps serving; the store counted all three requests
        let decision = assert_ok!(h.limiter.check_and_consume("alice", 5).await);
        assert!(decision.allowed);
        assert_eq!(decision.source, DecisionSource::Store);
        assert_eq!(decision.remaining, 2);
        assert_eq!(h.limiter.cache().get("alice").unwrap().count, 3);
    }

    #[tokio::test]
    async fn test_zero_window_is_rejected_while_degraded() {
        let h = harness_with_window(FailurePoint::BeforeApply, Duration::ZERO);
        h.store.set_failures(Failures::Always);

        for _ in 0..3 {
            let err = assert_err!(h.limiter.check_and_consume("alice", 2).await);
            assert!(matches!(err, TierlimitError::Invariant(_)));
        }
        assert!(h.limiter.cache().is_empty());
    }

    #[tokio::test]
    async fn test_zero_window_is_rejected_with_store() {
        let h = harness_with_window(FailurePoint::BeforeApply, Duration::ZERO);

        let err = assert_err!(h.limiter.check_and_consume("alice", 2).await);
        assert!(matches!(err, TierlimitError::Invariant(_)));
    }

    #[tokio::test]
    async fn test_subjects_are_independent() {
        let h = harness(FailurePoint::BeforeApply);

        for _ in 0..2 {
            h.limiter.check_and_consume("alice", 2).await.unwrap();
        }
        assert!(!h.limiter.check_and_consume("alice", 2).await.unwrap().allowed);

        let decision = h.limiter.check_and_consume("bob", 2).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    async fn test_custom_key_prefix() {
        let clock = MockClock::default();
        let store = Arc::new(InMemoryCounterStore::new(Arc::new(clock.clone())));
        let cache = Arc::new(LocalCache::new(Arc::new(clock)));
        let limiter = RateLimiter::new(store.clone(), cache, WINDOW).with_key_prefix("api");

        limiter.check_and_consume("alice", 5).await.unwrap();
        assert_eq!(store.get("api:alice"), Some(1));
        assert_eq!(store.get("rate_limit:alice"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_admit_exactly_limit() {
        let clock = MockClock::default();
        let store = Arc::new(InMemoryCounterStore::new(Arc::new(clock.clone())));
        let cache = Arc::new(LocalCache::new(Arc::new(clock)));
        let limiter = Arc::new(RateLimiter::new(store, cache, WINDOW));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check_and_consume("shared", 50).await.unwrap() })
            })
            .collect();

        let allowed = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|d| d.as_ref().unwrap().allowed)
            .count();

        assert_eq!(allowed, 50);
    }

    #[test]
    fn test_decision_serializes_millis() {
        let decision = Decision::from_count(2, 5, Duration::from_millis(1500), DecisionSource::Store);
        let json = serde_json::to_value(decision).unwrap();

        assert_eq!(json["allowed"], true);
        assert_eq!(json["remaining"], 3);
        assert_eq!(json["reset_in_ms"], 1500);
        assert_eq!(json["source"], "store");
    }
}
