//! Admission control on both sides of a call
//!
//! Consumers throttle outgoing requests per service with a fixed one-second
//! window. Providers cap in-flight requests per interface with an atomic
//! counter. Both keep one lazily created entry per name and reconfigure
//! its limit in place.

use crate::error::AdmissionKind;
use crate::metrics::TrafficMetrics;
use crate::{ClusterError, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Length of one rate limiting window
pub const RATE_WINDOW: Duration = Duration::from_millis(1000);

/// Wall-clock source in milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Hand-driven clock
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct RateWindow {
    max: AtomicI64,
    window_start: AtomicU64,
    count: AtomicI64,
}

/// Consumer-side requests-per-window limiter
pub struct RequestRateLimiter {
    windows: DashMap<String, Arc<RateWindow>>,
    clock: Arc<dyn Clock>,
    metrics: Option<TrafficMetrics>,
}

impl RequestRateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: TrafficMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the per-window maximum; `max <= 0` disables limiting
    pub fn configure(&self, name: &str, max: i64) {
        let now = self.clock.now_millis();
        let window = self
            .windows
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(RateWindow {
                    max: AtomicI64::new(max),
                    window_start: AtomicU64::new(now),
                    count: AtomicI64::new(0),
                })
            })
            .clone();
        window.max.store(max, Ordering::Relaxed);
        debug!("Rate limit for {} set to {} per {:?}", name, max, RATE_WINDOW);
    }

    pub fn limit(&self, name: &str) -> Option<i64> {
        self.windows.get(name).map(|w| w.max.load(Ordering::Relaxed))
    }

    /// Count one request against `name`'s window
    pub fn add_request(&self, name: &str) -> Result<()> {
        let Some(window) = self.windows.get(name).map(|w| Arc::clone(&w)) else {
            return Ok(());
        };
        let max = window.max.load(Ordering::Relaxed);
        if max <= 0 {
            return Ok(());
        }

        let now = self.clock.now_millis();
        let start = window.window_start.load(Ordering::Acquire);
        if now.saturating_sub(start) > RATE_WINDOW.as_millis() as u64 {
            window.window_start.store(now, Ordering::Release);
            window.count.store(0, Ordering::Release);
        }

        if window.count.load(Ordering::Acquire) >= max {
            debug!("Rate limit of {} reached for {}", max, name);
            if let Some(metrics) = &self.metrics {
                metrics.record_rejection(AdmissionKind::Rate);
            }
            return Err(ClusterError::AdmissionRejected {
                kind: AdmissionKind::Rate,
                name: name.to_string(),
                max,
            });
        }
        window.count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl Default for RequestRateLimiter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[derive(Debug, Default)]
struct ActiveCounter {
    max: AtomicU32,
    current: AtomicU32,
}

impl ActiveCounter {
    fn try_increase(&self) -> bool {
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let max = self.max.load(Ordering::Acquire);
                (max == 0 || current < max).then_some(current + 1)
            })
            .is_ok()
    }

    fn decrease(&self, name: &str) {
        if self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| current.checked_sub(1))
            .is_err()
        {
            warn!("Active request count for {} is already zero", name);
        }
    }
}

/// Provider-side cap on in-flight requests
#[derive(Default)]
pub struct ConcurrencyLimiter {
    counters: DashMap<String, Arc<ActiveCounter>>,
    metrics: Option<TrafficMetrics>,
}

impl ConcurrencyLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: TrafficMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Counter key for a method-scoped limit
    pub fn method_scope(interface: &str, method: &str) -> String {
        format!("{}#{}", interface, method)
    }

    fn counter(&self, name: &str) -> Arc<ActiveCounter> {
        self.counters
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Set the in-flight maximum; `0` means unlimited
    pub fn configure(&self, name: &str, max: u32) {
        self.counter(name).max.store(max, Ordering::Release);
        debug!("Concurrency limit for {} set to {}", name, max);
    }

    pub fn active(&self, name: &str) -> u32 {
        self.counters
            .get(name)
            .map_or(0, |c| c.current.load(Ordering::Acquire))
    }

    fn rejected(&self, name: &str, max: u32) -> ClusterError {
        if let Some(metrics) = &self.metrics {
            metrics.record_rejection(AdmissionKind::Concurrency);
        }
        ClusterError::AdmissionRejected {
            kind: AdmissionKind::Concurrency,
            name: name.to_string(),
            max: i64::from(max),
        }
    }

    /// Whether one more request would currently be admitted
    pub fn check_admission(&self, name: &str) -> Result<()> {
        let counter = self.counter(name);
        let max = counter.max.load(Ordering::Acquire);
        if max != 0 && counter.current.load(Ordering::Acquire) >= max {
            return Err(self.rejected(name, max));
        }
        Ok(())
    }

    /// Atomically take a slot if one is free
    pub fn increase(&self, name: &str) -> bool {
        self.counter(name).try_increase()
    }

    /// Release a slot; never drops below zero
    pub fn decrease(&self, name: &str) {
        self.counter(name).decrease(name);
    }

    /// Take a slot that is released when the permit drops
    pub fn acquire(&self, name: &str) -> Result<ConcurrencyPermit> {
        let counter = self.counter(name);
        if !counter.try_increase() {
            let max = counter.max.load(Ordering::Acquire);
            return Err(self.rejected(name, max));
        }
        Ok(ConcurrencyPermit {
            name: name.to_string(),
            counter,
        })
    }
}

/// In-flight slot held for the duration of one request
#[derive(Debug)]
pub struct ConcurrencyPermit {
    name: String,
    counter: Arc<ActiveCounter>,
}

impl ConcurrencyPermit {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.counter.decrease(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_at(start: u64) -> (Arc<ManualClock>, RequestRateLimiter) {
        let clock = Arc::new(ManualClock::new(start));
        let limiter = RequestRateLimiter::new(clock.clone());
        (clock, limiter)
    }

    #[test]
    fn test_rate_limit_per_window() {
        let (clock, limiter) = limiter_at(10_000);
        limiter.configure("com.acme.Greeter", 2);

        assert!(limiter.add_request("com.acme.Greeter").is_ok());
        assert!(limiter.add_request("com.acme.Greeter").is_ok());
        let err = limiter.add_request("com.acme.Greeter").unwrap_err();
        assert!(matches!(
            err,
            ClusterError::AdmissionRejected { kind: AdmissionKind::Rate, max: 2, .. }
        ));

        clock.advance(Duration::from_millis(1000));
        assert!(limiter.add_request("com.acme.Greeter").is_err());

        clock.advance(Duration::from_millis(1));
        assert!(limiter.add_request("com.acme.Greeter").is_ok());
        assert!(limiter.add_request("com.acme.Greeter").is_ok());
        assert!(limiter.add_request("com.acme.Greeter").is_err());
    }

    #[test]
    fn test_rate_limit_unconfigured_or_disabled() {
        let (_, limiter) = limiter_at(0);
        for _ in 0..100 {
            assert!(limiter.add_request("unknown").is_ok());
        }
        limiter.configure("off", 0);
        limiter.configure("negative", -1);
        for _ in 0..100 {
            assert!(limiter.add_request("off").is_ok());
            assert!(limiter.add_request("negative").is_ok());
        }
    }

    #[test]
    fn test_rate_limit_reconfigure_in_place() {
        let (_, limiter) = limiter_at(0);
        limiter.configure("svc", 1);
        assert!(limiter.add_request("svc").is_ok());
        assert!(limiter.add_request("svc").is_err());

        limiter.configure("svc", 3);
        assert_eq!(limiter.limit("svc"), Some(3));
        assert!(limiter.add_request("svc").is_ok());
        assert!(limiter.add_request("svc").is_ok());
        assert!(limiter.add_request("svc").is_err());
    }

    #[test]
    fn test_concurrency_limit() {
        let limiter = ConcurrencyLimiter::new();
        limiter.configure("com.acme.Greeter", 3);

        for _ in 0..3 {
            assert!(limiter.check_admission("com.acme.Greeter").is_ok());
            assert!(limiter.increase("com.acme.Greeter"));
        }
        assert!(limiter.check_admission("com.acme.Greeter").is_err());
        assert!(!limiter.increase("com.acme.Greeter"));
        assert_eq!(limiter.active("com.acme.Greeter"), 3);

        limiter.decrease("com.acme.Greeter");
        assert!(limiter.check_admission("com.acme.Greeter").is_ok());

        for _ in 0..5 {
            limiter.decrease("com.acme.Greeter");
        }
        assert_eq!(limiter.active("com.acme.Greeter"), 0);
    }

    #[test]
    fn test_concurrency_unlimited_when_zero() {
        let limiter = ConcurrencyLimiter::new();
        for _ in 0..50 {
            assert!(limiter.increase("fresh"));
        }
        assert_eq!(limiter.active("fresh"), 50);
        assert!(limiter.check_admission("fresh").is_ok());
    }

    #[test]
    fn test_permit_releases_once_on_drop() {
        let limiter = ConcurrencyLimiter::new();
        limiter.configure("svc", 1);
        {
            let permit = limiter.acquire("svc").unwrap();
            assert_eq!(permit.name(), "svc");
            assert_eq!(limiter.active("svc"), 1);
            let err = limiter.acquire("svc").unwrap_err();
            assert!(err.is_retryable());
        }
        assert_eq!(limiter.active("svc"), 0);
        assert!(limiter.acquire("svc").is_ok());
        assert_eq!(limiter.active("svc"), 0);
    }

    #[test]
    fn test_concurrent_increase_never_exceeds_max() {
        let limiter = Arc::new(ConcurrencyLimiter::new());
        limiter.configure("svc", 8);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..100).filter(|_| limiter.increase("svc")).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 8);
        assert_eq!(limiter.active("svc"), 8);
    }

    #[test]
    fn test_rejections_are_counted() {
        let metrics = TrafficMetrics::new().unwrap();
        let limiter = ConcurrencyLimiter::new().with_metrics(metrics.clone());
        limiter.configure("svc", 1);
        let _held = limiter.acquire("svc").unwrap();
        assert!(limiter.acquire("svc").is_err());
        assert_eq!(metrics.rejections(AdmissionKind::Concurrency), 1);
    }
}
