//! Metrics collection for NAT table activity.
//!
//! Provides thread-safe counters for mapping and connection lifecycle events
//! plus a gauge for the current table size.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Metrics registry for one NAT table.
#[derive(Debug, Default)]
pub struct NatMetrics {
    // Mapping lifecycle
    /// Number of mappings created.
    pub mappings_created: Counter,
    /// Number of mappings removed explicitly or on teardown.
    pub mappings_removed: Counter,
    /// Number of ICMP mappings expired by the reaper.
    pub icmp_mappings_expired: Counter,
    /// Number of TCP mappings expired by the reaper.
    pub tcp_mappings_expired: Counter,
    /// Number of inserts rejected because the pool was empty.
    pub allocation_failures: Counter,

    // Connection lifecycle
    /// Number of TCP connections created.
    pub connections_created: Counter,
    /// Number of TCP connections expired by the reaper.
    pub connections_expired: Counter,

    /// Number of completed reaper passes.
    pub reap_passes: Counter,

    /// Current number of mappings in the table.
    active_mappings: AtomicU64,
}

impl NatMetrics {
    /// Creates a new metrics registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the active mapping gauge.
    pub fn set_active_mappings(&self, count: usize) {
        self.active_mappings.store(count as u64, Ordering::Relaxed);
    }

    /// Gets the active mapping gauge.
    pub fn active_mappings(&self) -> u64 {
        self.active_mappings.load(Ordering::Relaxed)
    }

    /// Exports all metrics as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        vec![
            ("mappings_created".into(), self.mappings_created.get()),
            ("mappings_removed".into(), self.mappings_removed.get()),
            (
                "icmp_mappings_expired".into(),
                self.icmp_mappings_expired.get(),
            ),
            (
                "tcp_mappings_expired".into(),
                self.tcp_mappings_expired.get(),
            ),
            ("allocation_failures".into(), self.allocation_failures.get()),
            ("connections_created".into(), self.connections_created.get()),
            ("connections_expired".into(), self.connections_expired.get()),
            ("reap_passes".into(), self.reap_passes.get()),
            ("active_mappings".into(), self.active_mappings()),
        ]
    }
}
