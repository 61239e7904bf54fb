use crate::error::SyncError;
use std::time::Duration;

/// Runtime configuration for a table synchronization pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Trailing quiet interval after the most recent event before a flush fires.
    pub debounce_ms: u64,
    /// Interval of the unconditional flush timer that bounds latency under
    /// continuous event streams.
    pub periodic_flush_ms: u64,
    pub default_page_size: usize,
    /// An apply whose completion never arrives is considered finished after this.
    pub apply_timeout_ms: u64,
    /// Authoritative count re-query interval. Zero disables reconciliation.
    pub count_reconcile_interval_ms: u64,
    pub adaptive_flush_enabled: bool,
    pub adaptive_debounce_floor_ms: u64,
    pub adaptive_debounce_ceiling_ms: u64,
    pub adaptive_target_batch: usize,
    pub suppress_flash: bool,
    pub suppress_vertical_scroll: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 150,
            periodic_flush_ms: 100,
            default_page_size: 50,
            apply_timeout_ms: 5_000,
            count_reconcile_interval_ms: 30_000,
            adaptive_flush_enabled: false,
            adaptive_debounce_floor_ms: 25,
            adaptive_debounce_ceiling_ms: 150,
            adaptive_target_batch: 64,
            suppress_flash: true,
            suppress_vertical_scroll: true,
        }
    }
}

impl SyncConfig {
    /// Profile for tables that see sustained bursts (hundreds of events per
    /// second). The debounce adapts to observed batch sizes.
    pub fn high_frequency() -> Self {
        Self {
            periodic_flush_ms: 50,
            adaptive_flush_enabled: true,
            adaptive_target_batch: 128,
            ..Self::default()
        }
    }

    pub fn low_latency() -> Self {
        Self {
            debounce_ms: 30,
            periodic_flush_ms: 30,
            adaptive_debounce_floor_ms: 10,
            adaptive_debounce_ceiling_ms: 30,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.default_page_size == 0 {
            return Err(invalid("default_page_size must be > 0"));
        }
        if self.debounce_ms == 0 {
            return Err(invalid("debounce_ms must be > 0"));
        }
        if self.periodic_flush_ms == 0 {
            return Err(invalid("periodic_flush_ms must be > 0"));
        }
        if self.apply_timeout_ms == 0 {
            return Err(invalid("apply_timeout_ms must be > 0"));
        }
        if self.adaptive_flush_enabled {
            if self.adaptive_debounce_floor_ms == 0 {
                return Err(invalid("adaptive_debounce_floor_ms must be > 0"));
            }
            if self.adaptive_debounce_floor_ms > self.adaptive_debounce_ceiling_ms {
                return Err(invalid(
                    "adaptive_debounce_floor_ms must not exceed adaptive_debounce_ceiling_ms",
                ));
            }
            if self.adaptive_target_batch == 0 {
                return Err(invalid("adaptive_target_batch must be > 0"));
            }
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn periodic_flush(&self) -> Duration {
        Duration::from_millis(self.periodic_flush_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn count_reconcile_interval(&self) -> Option<Duration> {
        (self.count_reconcile_interval_ms > 0)
            .then(|| Duration::from_millis(self.count_reconcile_interval_ms))
    }
}

fn invalid(message: &str) -> SyncError {
    SyncError::InvalidConfig {
        message: message.into(),
    }
}
