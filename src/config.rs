//! Engine configuration.

use crate::error::{EngineError, EngineResult};
use crate::storage::ExpiryConfig;

/// Default scan slots per shard.
pub const DEFAULT_SCAN_SLOTS: usize = 1024;

/// Upper bound on the number of shards (shard ids are `u16`).
pub const MAX_SHARDS: usize = 1 << 16;

/// Configuration for a [`ShardSet`](crate::engine::ShardSet).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of shards, one thread each (default: available parallelism)
    pub shards: usize,

    /// Fixed number of scan slots per shard; must be a power of two
    pub scan_slots: usize,

    /// Active expiry settings
    pub expiry: ExpiryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            shards,
            scan_slots: DEFAULT_SCAN_SLOTS,
            expiry: ExpiryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Checks the configuration before any shard is started.
    pub fn validate(&self) -> EngineResult<()> {
        if self.shards == 0 || self.shards > MAX_SHARDS {
            return Err(EngineError::invalid(format!(
                "shard count must be between 1 and {}",
                MAX_SHARDS
            )));
        }
        if !self.scan_slots.is_power_of_two() || self.scan_slots > u32::MAX as usize {
            return Err(EngineError::invalid(
                "scan slot count must be a power of two that fits in 32 bits",
            ));
        }
        if self.expiry.sweep_budget == 0 {
            return Err(EngineError::invalid("sweep budget must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.shards >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = EngineConfig {
            shards: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            scan_slots: 1000,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
