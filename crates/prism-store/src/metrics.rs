//! Store operation metrics.
//!
//! Thin wrapper over the `metrics` facade so backends record counters
//! without caring which exporter (if any) is installed.

use metrics::counter;

/// Per-backend metric recorder.
#[derive(Debug, Clone, Default)]
pub struct StoreMetrics;

impl StoreMetrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_read(&self) {
        counter!("prism_store_reads_total").increment(1);
    }

    pub fn record_query(&self) {
        counter!("prism_store_queries_total").increment(1);
    }

    pub fn record_commit(&self, ops: usize) {
        counter!("prism_store_commits_total").increment(1);
        counter!("prism_store_committed_ops_total").increment(ops as u64);
    }

    pub fn record_conflict(&self) {
        counter!("prism_store_conflicts_total").increment(1);
    }
}
