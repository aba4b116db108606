//! Metrics for the scattered core.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ScatteredMetrics                         │
//! │  ┌──────────────────┐ ┌──────────────────┐ ┌─────────────┐  │
//! │  │  Invalidation    │ │      Bias        │ │  Transfer   │  │
//! │  │ - batches sent   │ │ - grants         │ │ - failures  │  │
//! │  │ - retries        │ │ - revocations    │ │ - values    │  │
//! │  │ - removal batches│ │ - renewals       │ │ - chunks    │  │
//! │  └──────────────────┘ └──────────────────┘ └─────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Counters and gauges are plain atomics; recording never blocks.

mod counters;
mod gauges;

pub use counters::Counter;
pub use gauges::Gauge;

/// Metrics of one scattered node.
#[derive(Debug)]
pub struct ScatteredMetrics {
    /// Regular invalidation broadcasts sent.
    pub invalidation_batches: Counter,
    /// Invalidation broadcasts re-sent after a failure.
    pub invalidation_retries: Counter,
    /// Removal invalidation broadcasts sent.
    pub removal_batches: Counter,

    /// Biases granted to remote readers or writers.
    pub bias_grants: Counter,
    /// Revocation rounds completed.
    pub bias_revocations: Counter,
    /// Revocation rounds that failed.
    pub bias_revocation_failures: Counter,
    /// Local biases renewed with the owner.
    pub bias_renewals: Counter,
    /// Local biases dropped because they expired.
    pub bias_expirations: Counter,

    /// Inbound key transfers that failed.
    pub key_transfer_failures: Counter,
    /// Value fetches that failed.
    pub value_transfer_failures: Counter,
    /// Backup chunks that failed.
    pub backup_failures: Counter,
    /// Values applied from transfers.
    pub values_applied: Counter,
    /// Transfer chunks currently in flight.
    pub outstanding_chunks: Gauge,
}

impl ScatteredMetrics {
    /// Create a new set of metrics.
    pub fn new() -> Self {
        Self {
            invalidation_batches: Counter::new(
                "scattered_invalidation_batches_total",
                "Regular invalidation broadcasts sent",
            ),
            invalidation_retries: Counter::new(
                "scattered_invalidation_retries_total",
                "Invalidation broadcasts re-sent after failure",
            ),
            removal_batches: Counter::new(
                "scattered_removal_batches_total",
                "Removal invalidation broadcasts sent",
            ),
            bias_grants: Counter::new("scattered_bias_grants_total", "Biases granted"),
            bias_revocations: Counter::new(
                "scattered_bias_revocations_total",
                "Bias revocation rounds completed",
            ),
            bias_revocation_failures: Counter::new(
                "scattered_bias_revocation_failures_total",
                "Bias revocation rounds that failed",
            ),
            bias_renewals: Counter::new("scattered_bias_renewals_total", "Local biases renewed"),
            bias_expirations: Counter::new(
                "scattered_bias_expirations_total",
                "Local biases expired",
            ),
            key_transfer_failures: Counter::new(
                "scattered_key_transfer_failures_total",
                "Inbound key transfers that failed",
            ),
            value_transfer_failures: Counter::new(
                "scattered_value_transfer_failures_total",
                "Value fetches that failed",
            ),
            backup_failures: Counter::new(
                "scattered_backup_failures_total",
                "Backup chunks that failed",
            ),
            values_applied: Counter::new(
                "scattered_values_applied_total",
                "Values applied from state transfer",
            ),
            outstanding_chunks: Gauge::new(
                "scattered_outstanding_chunks",
                "Transfer chunks in flight",
            ),
        }
    }

    /// Get a snapshot of the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            invalidation_batches: self.invalidation_batches.get(),
            invalidation_retries: self.invalidation_retries.get(),
            removal_batches: self.removal_batches.get(),
            bias_grants: self.bias_grants.get(),
            bias_revocations: self.bias_revocations.get(),
            bias_revocation_failures: self.bias_revocation_failures.get(),
            bias_renewals: self.bias_renewals.get(),
            bias_expirations: self.bias_expirations.get(),
            key_transfer_failures: self.key_transfer_failures.get(),
            value_transfer_failures: self.value_transfer_failures.get(),
            backup_failures: self.backup_failures.get(),
            values_applied: self.values_applied.get(),
            outstanding_chunks: self.outstanding_chunks.get(),
            outstanding_chunks_peak: self.outstanding_chunks.peak(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        for counter in [
            &self.invalidation_batches,
            &self.invalidation_retries,
            &self.removal_batches,
            &self.bias_grants,
            &self.bias_revocations,
            &self.bias_revocation_failures,
            &self.bias_renewals,
            &self.bias_expirations,
            &self.key_transfer_failures,
            &self.value_transfer_failures,
            &self.backup_failures,
            &self.values_applied,
        ] {
            counter.write_to(&mut output);
        }
        self.outstanding_chunks.write_to(&mut output);
        output
    }
}

impl Default for ScatteredMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of scattered metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub invalidation_batches: u64,
    pub invalidation_retries: u64,
    pub removal_batches: u64,
    pub bias_grants: u64,
    pub bias_revocations: u64,
    pub bias_revocation_failures: u64,
    pub bias_renewals: u64,
    pub bias_expirations: u64,
    pub key_transfer_failures: u64,
    pub value_transfer_failures: u64,
    pub backup_failures: u64,
    pub values_applied: u64,
    pub outstanding_chunks: i64,
    pub outstanding_chunks_peak: i64,
}
