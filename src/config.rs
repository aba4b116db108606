//! Configuration types for the scattered core.

use crate::error::{Error, Result};
use crate::types::NodeId;
use std::time::Duration;

/// Main configuration for one scattered cache member.
#[derive(Debug, Clone)]
pub struct ScatteredConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Number of segments; fixed for the lifetime of the cache.
    pub num_segments: u32,

    /// Pending invalidations that trigger a broadcast.
    pub invalidation_batch_size: usize,

    /// Pause before re-sending a failed invalidation broadcast.
    pub invalidation_retry_delay: Duration,

    /// State transfer configuration.
    pub state_transfer: StateTransferConfig,

    /// Read bias configuration.
    pub bias: BiasConfig,
}

impl Default for ScatteredConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            num_segments: 256,
            invalidation_batch_size: 128,
            invalidation_retry_delay: Duration::from_millis(50),
            state_transfer: StateTransferConfig::default(),
            bias: BiasConfig::default(),
        }
    }
}

impl ScatteredConfig {
    /// Create a new configuration with the given node ID.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Set the number of segments.
    pub fn with_num_segments(mut self, num_segments: u32) -> Self {
        self.num_segments = num_segments;
        self
    }

    /// Set the invalidation batch size.
    pub fn with_invalidation_batch_size(mut self, size: usize) -> Self {
        self.invalidation_batch_size = size;
        self
    }

    /// Set the delay between invalidation retries.
    pub fn with_invalidation_retry_delay(mut self, delay: Duration) -> Self {
        self.invalidation_retry_delay = delay;
        self
    }

    /// Set the state transfer configuration.
    pub fn with_state_transfer(mut self, state_transfer: StateTransferConfig) -> Self {
        self.state_transfer = state_transfer;
        self
    }

    /// Set the bias configuration.
    pub fn with_bias(mut self, bias: BiasConfig) -> Self {
        self.bias = bias;
        self
    }

    /// Check the configuration for inconsistent values.
    pub fn validate(&self) -> Result<()> {
        if self.num_segments == 0 {
            return Err(Error::Config("num_segments must be positive".into()));
        }
        if self.invalidation_batch_size == 0 {
            return Err(Error::Config(
                "invalidation_batch_size must be positive".into(),
            ));
        }
        if self.state_transfer.chunk_size == 0 {
            return Err(Error::Config("state transfer chunk_size must be positive".into()));
        }
        if self.state_transfer.max_outstanding_chunks == 0 {
            return Err(Error::Config(
                "state transfer max_outstanding_chunks must be positive".into(),
            ));
        }
        if self.bias.acquisition != BiasAcquisition::Never
            && self.bias.remote_timeout >= self.bias.lifespan
        {
            return Err(Error::Config(format!(
                "bias lifespan {:?} must exceed the remote timeout {:?}",
                self.bias.lifespan, self.bias.remote_timeout
            )));
        }
        Ok(())
    }
}

/// State transfer configuration.
#[derive(Debug, Clone)]
pub struct StateTransferConfig {
    /// Whether joining nodes pull state at all.
    pub fetch_enabled: bool,

    /// Keys or entries per transfer chunk.
    pub chunk_size: usize,

    /// Timeout for transfer RPCs and for waiting on a topology install.
    pub timeout: Duration,

    /// Maximum number of value/backup/invalidation chunks in flight.
    pub max_outstanding_chunks: usize,
}

impl Default for StateTransferConfig {
    fn default() -> Self {
        Self {
            fetch_enabled: true,
            chunk_size: 512,
            timeout: Duration::from_secs(240),
            max_outstanding_chunks: 16,
        }
    }
}

impl StateTransferConfig {
    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the transfer timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the limit of chunks in flight.
    pub fn with_max_outstanding_chunks(mut self, max: usize) -> Self {
        self.max_outstanding_chunks = max;
        self
    }

    /// Enable or disable state fetching.
    pub fn with_fetch_enabled(mut self, enabled: bool) -> Self {
        self.fetch_enabled = enabled;
        self
    }
}

/// When a node acquires a read bias for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiasAcquisition {
    /// Biases are never granted.
    Never,
    /// The writer of a key becomes biased.
    OnWrite,
    /// Readers become biased when nobody else is; writers too.
    OnRead,
}

/// Read bias (lease) configuration.
#[derive(Debug, Clone)]
pub struct BiasConfig {
    /// Acquisition policy.
    pub acquisition: BiasAcquisition,

    /// How long a bias stays valid without renewal.
    pub lifespan: Duration,

    /// Timeout for bias RPCs; renewal starts this long before expiry.
    pub remote_timeout: Duration,

    /// Period of the renewal and expiry sweep; derived when `None`.
    pub wake_up_interval: Option<Duration>,
}

impl Default for BiasConfig {
    fn default() -> Self {
        Self {
            acquisition: BiasAcquisition::OnWrite,
            lifespan: Duration::from_secs(300),
            remote_timeout: Duration::from_secs(15),
            wake_up_interval: None,
        }
    }
}

impl BiasConfig {
    /// Set the acquisition policy.
    pub fn with_acquisition(mut self, acquisition: BiasAcquisition) -> Self {
        self.acquisition = acquisition;
        self
    }

    /// Set the bias lifespan.
    pub fn with_lifespan(mut self, lifespan: Duration) -> Self {
        self.lifespan = lifespan;
        self
    }

    /// Set the remote timeout.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Set the sweep period explicitly.
    pub fn with_wake_up_interval(mut self, interval: Duration) -> Self {
        self.wake_up_interval = Some(interval);
        self
    }

    /// Age after which a read local bias is renewed.
    pub fn renewal_threshold(&self) -> Duration {
        self.lifespan.saturating_sub(self.remote_timeout)
    }

    /// Effective sweep period.
    pub fn effective_wake_up_interval(&self) -> Duration {
        self.wake_up_interval
            .unwrap_or_else(|| (self.renewal_threshold() / 2).max(Duration::from_millis(10)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ScatteredConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        assert!(ScatteredConfig::new(1)
            .with_num_segments(0)
            .validate()
            .is_err());
        assert!(ScatteredConfig::new(1)
            .with_invalidation_batch_size(0)
            .validate()
            .is_err());

        let bias = BiasConfig::default()
            .with_lifespan(Duration::from_secs(1))
            .with_remote_timeout(Duration::from_secs(2));
        assert!(ScatteredConfig::new(1).with_bias(bias.clone()).validate().is_err());

        // lifespan is irrelevant when biasing is off
        let off = bias.with_acquisition(BiasAcquisition::Never);
        assert!(ScatteredConfig::new(1).with_bias(off).validate().is_ok());
    }

    #[test]
    fn test_wake_up_interval() {
        let bias = BiasConfig::default()
            .with_lifespan(Duration::from_millis(1000))
            .with_remote_timeout(Duration::from_millis(200));
        assert_eq!(bias.renewal_threshold(), Duration::from_millis(800));
        assert_eq!(bias.effective_wake_up_interval(), Duration::from_millis(400));

        let bias = bias.with_wake_up_interval(Duration::from_millis(100));
        assert_eq!(bias.effective_wake_up_interval(), Duration::from_millis(100));
    }
}
