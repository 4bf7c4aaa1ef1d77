//! Lightweight global metrics for the PM engine.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Sweep (запуски/пропуски/ошибки, длительность)
//! - Group classifier
//! - Short-term history (store/prune/inject/invalid)
//! - Compounding
//! - DBSync

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Sweep -----
static SWEEPS_STARTED: AtomicU64 = AtomicU64::new(0);
static SWEEPS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static SWEEPS_SKIPPED: AtomicU64 = AtomicU64::new(0);
static SWEEPS_FAILED: AtomicU64 = AtomicU64::new(0);
static SWEEP_LAST_DURATION_US: AtomicU64 = AtomicU64::new(0);

// ----- Groups -----
static GROUP_CAPACITY_OVERFLOWS: AtomicU64 = AtomicU64::new(0);

// ----- History -----
static COMPOSITES_STORED: AtomicU64 = AtomicU64::new(0);
static HISTORY_BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static HISTORY_FILES_PRUNED: AtomicU64 = AtomicU64::new(0);
static HISTORY_BYTES_PRUNED: AtomicU64 = AtomicU64::new(0);
static HISTORY_FILES_INJECTED: AtomicU64 = AtomicU64::new(0);
static HISTORY_INVALID_FILES: AtomicU64 = AtomicU64::new(0);

// ----- Compounding -----
static COMPOUND_NAME_FIXES: AtomicU64 = AtomicU64::new(0);
static COMPOUND_TOPOLOGY_CHANGES: AtomicU64 = AtomicU64::new(0);

// ----- DBSync -----
static DBSYNC_RAM_IMAGES_SENT: AtomicU64 = AtomicU64::new(0);
static DBSYNC_HISTORY_IMAGES_SENT: AtomicU64 = AtomicU64::new(0);
static DBSYNC_SEND_ERRORS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    // Sweep
    pub sweeps_started: u64,
    pub sweeps_completed: u64,
    pub sweeps_skipped: u64,
    pub sweeps_failed: u64,
    pub sweep_last_duration_us: u64,

    // Groups
    pub group_capacity_overflows: u64,

    // History
    pub composites_stored: u64,
    pub history_bytes_written: u64,
    pub history_files_pruned: u64,
    pub history_bytes_pruned: u64,
    pub history_files_injected: u64,
    pub history_invalid_files: u64,

    // Compounding
    pub compound_name_fixes: u64,
    pub compound_topology_changes: u64,

    // DBSync
    pub dbsync_ram_images_sent: u64,
    pub dbsync_history_images_sent: u64,
    pub dbsync_send_errors: u64,
}

impl MetricsSnapshot {
    pub fn sweep_success_ratio(&self) -> f64 {
        if self.sweeps_started == 0 {
            0.0
        } else {
            self.sweeps_completed as f64 / self.sweeps_started as f64
        }
    }

    /// Prometheus text exposition.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let rows: [(&str, &str, u64); 18] = [
            ("pm_sweeps_started_total", "counter", self.sweeps_started),
            ("pm_sweeps_completed_total", "counter", self.sweeps_completed),
            ("pm_sweeps_skipped_total", "counter", self.sweeps_skipped),
            ("pm_sweeps_failed_total", "counter", self.sweeps_failed),
            ("pm_sweep_last_duration_us", "gauge", self.sweep_last_duration_us),
            ("pm_group_capacity_overflows_total", "counter", self.group_capacity_overflows),
            ("pm_composites_stored_total", "counter", self.composites_stored),
            ("pm_history_bytes_written_total", "counter", self.history_bytes_written),
            ("pm_history_files_pruned_total", "counter", self.history_files_pruned),
            ("pm_history_bytes_pruned_total", "counter", self.history_bytes_pruned),
            ("pm_history_files_injected_total", "counter", self.history_files_injected),
            ("pm_history_invalid_files_total", "counter", self.history_invalid_files),
            ("pm_compound_name_fixes_total", "counter", self.compound_name_fixes),
            ("pm_compound_topology_changes_total", "counter", self.compound_topology_changes),
            ("pm_dbsync_ram_images_sent_total", "counter", self.dbsync_ram_images_sent),
            ("pm_dbsync_history_images_sent_total", "counter", self.dbsync_history_images_sent),
            ("pm_dbsync_send_errors_total", "counter", self.dbsync_send_errors),
            (
                "pm_sweep_success_ratio_permille",
                "gauge",
                (self.sweep_success_ratio() * 1000.0) as u64,
            ),
        ];
        for (name, kind, v) in rows {
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            let _ = writeln!(out, "{} {}", name, v);
        }
        out
    }
}

// ----- Recorders (Sweep) -----
pub fn record_sweep_started() {
    SWEEPS_STARTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_sweep_completed(duration_us: u64) {
    SWEEPS_COMPLETED.fetch_add(1, Ordering::Relaxed);
    SWEEP_LAST_DURATION_US.store(duration_us, Ordering::Relaxed);
}

pub fn record_sweep_skipped() {
    SWEEPS_SKIPPED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_sweep_failed() {
    SWEEPS_FAILED.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Groups) -----
pub fn record_group_overflow() {
    GROUP_CAPACITY_OVERFLOWS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (History) -----
pub fn record_composite_stored(bytes: u64) {
    COMPOSITES_STORED.fetch_add(1, Ordering::Relaxed);
    HISTORY_BYTES_WRITTEN.fetch_add(bytes, Ordering::Relaxed);
}

pub fn record_history_pruned(bytes: u64) {
    HISTORY_FILES_PRUNED.fetch_add(1, Ordering::Relaxed);
    HISTORY_BYTES_PRUNED.fetch_add(bytes, Ordering::Relaxed);
}

pub fn record_history_injected() {
    HISTORY_FILES_INJECTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_history_invalid() {
    HISTORY_INVALID_FILES.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Compounding) -----
pub fn record_compound_name_fix() {
    COMPOUND_NAME_FIXES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_compound_topology_change() {
    COMPOUND_TOPOLOGY_CHANGES.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (DBSync) -----
pub fn record_dbsync_ram_sent() {
    DBSYNC_RAM_IMAGES_SENT.fetch_add(1, Ordering::Relaxed);
}

pub fn record_dbsync_history_sent() {
    DBSYNC_HISTORY_IMAGES_SENT.fetch_add(1, Ordering::Relaxed);
}

pub fn record_dbsync_send_error() {
    DBSYNC_SEND_ERRORS.fetch_add(1, Ordering::Relaxed);
}

// ----- Snapshot/reset -----
pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        sweeps_started: SWEEPS_STARTED.load(Ordering::Relaxed),
        sweeps_completed: SWEEPS_COMPLETED.load(Ordering::Relaxed),
        sweeps_skipped: SWEEPS_SKIPPED.load(Ordering::Relaxed),
        sweeps_failed: SWEEPS_FAILED.load(Ordering::Relaxed),
        sweep_last_duration_us: SWEEP_LAST_DURATION_US.load(Ordering::Relaxed),

        group_capacity_overflows: GROUP_CAPACITY_OVERFLOWS.load(Ordering::Relaxed),

        composites_stored: COMPOSITES_STORED.load(Ordering::Relaxed),
        history_bytes_written: HISTORY_BYTES_WRITTEN.load(Ordering::Relaxed),
        history_files_pruned: HISTORY_FILES_PRUNED.load(Ordering::Relaxed),
        history_bytes_pruned: HISTORY_BYTES_PRUNED.load(Ordering::Relaxed),
        history_files_injected: HISTORY_FILES_INJECTED.load(Ordering::Relaxed),
        history_invalid_files: HISTORY_INVALID_FILES.load(Ordering::Relaxed),

        compound_name_fixes: COMPOUND_NAME_FIXES.load(Ordering::Relaxed),
        compound_topology_changes: COMPOUND_TOPOLOGY_CHANGES.load(Ordering::Relaxed),

        dbsync_ram_images_sent: DBSYNC_RAM_IMAGES_SENT.load(Ordering::Relaxed),
        dbsync_history_images_sent: DBSYNC_HISTORY_IMAGES_SENT.load(Ordering::Relaxed),
        dbsync_send_errors: DBSYNC_SEND_ERRORS.load(Ordering::Relaxed),
    }
}

pub fn metrics_reset() {
    for c in [
        &SWEEPS_STARTED,
        &SWEEPS_COMPLETED,
        &SWEEPS_SKIPPED,
        &SWEEPS_FAILED,
        &SWEEP_LAST_DURATION_US,
        &GROUP_CAPACITY_OVERFLOWS,
        &COMPOSITES_STORED,
        &HISTORY_BYTES_WRITTEN,
        &HISTORY_FILES_PRUNED,
        &HISTORY_BYTES_PRUNED,
        &HISTORY_FILES_INJECTED,
        &HISTORY_INVALID_FILES,
        &COMPOUND_NAME_FIXES,
        &COMPOUND_TOPOLOGY_CHANGES,
        &DBSYNC_RAM_IMAGES_SENT,
        &DBSYNC_HISTORY_IMAGES_SENT,
        &DBSYNC_SEND_ERRORS,
    ] {
        c.store(0, Ordering::Relaxed);
    }
}
