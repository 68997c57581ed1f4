//! Core Metrics
//!
//! Cache-line aligned counters recorded by the reconciler and the device
//! layer dispatcher. The binary exports them as prometheus gauges.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

#[inline]
fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

// =============================================================================
// Reconcile Metrics
// =============================================================================

/// Counters of the replica reconciler
#[repr(C, align(64))]
#[derive(Debug)]
pub struct ReconcileMetrics {
    /// Reconciliation attempts on tracked definitions
    pub manage_calls: AtomicU64,
    /// Definitions that reached their replica target
    pub converged: AtomicU64,
    /// Replacements scheduled (placement succeeded)
    pub scheduled: AtomicU64,
    /// Attempts left queued for the next cycle
    pub retry_later: AtomicU64,
    /// Definitions found without any connected diskful replica
    pub needs_diskful: AtomicU64,
    /// Placement requests without a viable candidate
    pub placement_failures: AtomicU64,
    /// Last cycle timestamp (Unix millis)
    pub last_cycle_ms: AtomicU64,
    _padding: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<ReconcileMetrics>() <= CACHE_LINE_SIZE);

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconcileMetrics {
    pub fn new() -> Self {
        Self {
            manage_calls: AtomicU64::new(0),
            converged: AtomicU64::new(0),
            scheduled: AtomicU64::new(0),
            retry_later: AtomicU64::new(0),
            needs_diskful: AtomicU64::new(0),
            placement_failures: AtomicU64::new(0),
            last_cycle_ms: AtomicU64::new(0),
            _padding: [0; 8],
        }
    }

    #[inline]
    pub fn record_manage(&self) {
        self.manage_calls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_converged(&self) {
        self.converged.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_retry_later(&self) {
        self.retry_later.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_needs_diskful(&self) {
        self.needs_diskful.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_placement_failure(&self) {
        self.placement_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cycle(&self) {
        self.last_cycle_ms.store(now_ms(), Ordering::Release);
    }

    pub fn snapshot(&self) -> ReconcileMetricsSnapshot {
        ReconcileMetricsSnapshot {
            manage_calls: self.manage_calls.load(Ordering::Relaxed),
            converged: self.converged.load(Ordering::Relaxed),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            retry_later: self.retry_later.load(Ordering::Relaxed),
            needs_diskful: self.needs_diskful.load(Ordering::Relaxed),
            placement_failures: self.placement_failures.load(Ordering::Relaxed),
            last_cycle_ms: self.last_cycle_ms.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time copy of [`ReconcileMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileMetricsSnapshot {
    pub manage_calls: u64,
    pub converged: u64,
    pub scheduled: u64,
    pub retry_later: u64,
    pub needs_diskful: u64,
    pub placement_failures: u64,
    pub last_cycle_ms: u64,
}

// =============================================================================
// Dispatch Metrics
// =============================================================================

/// Counters of the satellite device layer dispatcher
#[repr(C, align(64))]
#[derive(Debug)]
pub struct DispatchMetrics {
    pub batches: AtomicU64,
    /// Root resources that went through a process call
    pub resources_processed: AtomicU64,
    pub resource_failures: AtomicU64,
    pub prepare_failures: AtomicU64,
    pub cleanup_failures: AtomicU64,
    /// Dispatches aborted by an implementation error
    pub fatal_errors: AtomicU64,
    /// Last dispatch timestamp (Unix millis)
    pub last_dispatch_ms: AtomicU64,
    _padding: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<DispatchMetrics>() <= CACHE_LINE_SIZE);

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self {
            batches: AtomicU64::new(0),
            resources_processed: AtomicU64::new(0),
            resource_failures: AtomicU64::new(0),
            prepare_failures: AtomicU64::new(0),
            cleanup_failures: AtomicU64::new(0),
            fatal_errors: AtomicU64::new(0),
            last_dispatch_ms: AtomicU64::new(0),
            _padding: [0; 8],
        }
    }

    #[inline]
    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.last_dispatch_ms.store(now_ms(), Ordering::Release);
    }

    #[inline]
    pub fn record_processed(&self, failed: bool) {
        self.resources_processed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.resource_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_prepare_failure(&self) {
        self.prepare_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cleanup_failure(&self) {
        self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fatal(&self) {
        self.fatal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        DispatchMetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            resources_processed: self.resources_processed.load(Ordering::Relaxed),
            resource_failures: self.resource_failures.load(Ordering::Relaxed),
            prepare_failures: self.prepare_failures.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
            last_dispatch_ms: self.last_dispatch_ms.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time copy of [`DispatchMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMetricsSnapshot {
    pub batches: u64,
    pub resources_processed: u64,
    pub resource_failures: u64,
    pub prepare_failures: u64,
    pub cleanup_failures: u64,
    pub fatal_errors: u64,
    pub last_dispatch_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        assert_eq!(std::mem::align_of::<ReconcileMetrics>(), CACHE_LINE_SIZE);
        assert_eq!(std::mem::align_of::<DispatchMetrics>(), CACHE_LINE_SIZE);
    }

    #[test]
    fn test_dispatch_counters() {
        let metrics = DispatchMetrics::new();
        metrics.record_batch();
        metrics.record_processed(false);
        metrics.record_processed(true);
        metrics.record_prepare_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.batches, 1);
        assert_eq!(snap.resources_processed, 2);
        assert_eq!(snap.resource_failures, 1);
        assert_eq!(snap.prepare_failures, 1);
        assert!(snap.last_dispatch_ms > 0);
    }

    #[test]
    fn test_reconcile_counters() {
        let metrics = ReconcileMetrics::default();
        metrics.record_manage();
        metrics.record_manage();
        metrics.record_converged();
        metrics.record_placement_failure();
        metrics.record_retry_later();

        let snap = metrics.snapshot();
        assert_eq!(snap.manage_calls, 2);
        assert_eq!(snap.converged, 1);
        assert_eq!(snap.placement_failures, 1);
        assert_eq!(snap.retry_later, 1);
        assert_eq!(snap.last_cycle_ms, 0);
    }
}
