//! Metric descriptions for everything the engine and store record.

use metrics::describe_counter;

/// Register descriptions for all metrics the workspace emits.
pub fn init_metrics_descriptions() {
    // Store metrics
    describe_counter!(
        "prism_store_reads_total",
        "Total number of single-document reads"
    );
    describe_counter!(
        "prism_store_queries_total",
        "Total number of filtered collection queries"
    );
    describe_counter!(
        "prism_store_commits_total",
        "Total number of committed transactions"
    );
    describe_counter!(
        "prism_store_committed_ops_total",
        "Total number of write operations inside committed transactions"
    );
    describe_counter!(
        "prism_store_conflicts_total",
        "Total number of transactions aborted by optimistic conflict"
    );
}
