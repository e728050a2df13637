//! Metrics collection for observability

use metrics::{counter, describe_counter, describe_histogram, gauge, histogram};
use std::time::Instant;

/// Initialize metrics with descriptions
pub fn init_metrics() {
    // Transaction metrics
    describe_counter!("crypto.transactions.committed", "Transactions committed");
    describe_counter!("crypto.transactions.rolled_back", "Transactions rolled back");
    describe_histogram!(
        "crypto.transaction.duration_ms",
        "Transaction duration in milliseconds"
    );

    // Proteus metrics
    describe_counter!("proteus.prekeys.created", "Prekeys generated");
    describe_counter!("proteus.sessions.created", "Pairwise sessions established");
    describe_counter!("proteus.messages.encrypted", "Pairwise messages encrypted");
    describe_counter!("proteus.messages.decrypted", "Pairwise messages decrypted");

    // MLS metrics
    describe_counter!("mls.key_packages.created", "Key packages generated");
    describe_counter!("mls.groups.created", "Groups created");
    describe_counter!("mls.welcomes.processed", "Welcomes processed");
    describe_counter!("mls.commits.staged", "Commits staged");
    describe_counter!("mls.commits.accepted", "Commits accepted");
    describe_counter!("mls.commits.applied", "Remote commits applied");
    describe_counter!("mls.proposals.buffered", "Proposals buffered");
    describe_counter!("mls.messages.encrypted", "Group messages encrypted");
    describe_counter!("mls.messages.decrypted", "Group messages decrypted");
    describe_counter!("mls.external_joins", "External joins performed");

    // Migration metrics
    describe_counter!(
        "migration.conversations.completed",
        "Conversations fully migrated to MLS"
    );
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

/// Record a histogram metric
pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    /// Create a new timer
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), start: Instant::now() }
    }

    /// Stop the timer and record the duration
    pub fn stop(self) {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
    }
}
