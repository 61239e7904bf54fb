use crate::config::SyncConfig;
use std::time::Duration;

/// Frequency-adaptive debounce. Tracks an EWMA of flushed batch sizes and
/// shortens the quiet interval while bursts keep batches above target.
#[derive(Debug, Clone)]
pub(super) struct AdaptiveFlushState {
    debounce_ms: u64,
    ewma_batch: u64,
}

impl AdaptiveFlushState {
    pub(super) fn from_config(config: &SyncConfig) -> Self {
        Self {
            debounce_ms: config.debounce_ms.max(1),
            ewma_batch: 0,
        }
    }

    pub(super) fn debounce(&self, config: &SyncConfig) -> Duration {
        if !config.adaptive_flush_enabled {
            return config.debounce();
        }
        Duration::from_millis(self.debounce_ms.clamp(
            config.adaptive_debounce_floor_ms.max(1),
            config.adaptive_debounce_ceiling_ms.max(1),
        ))
    }

    pub(super) fn observe_flush(&mut self, config: &SyncConfig, batch_len: usize) {
        if !config.adaptive_flush_enabled {
            return;
        }
        self.ewma_batch = ((self.ewma_batch * 7) + batch_len as u64) / 8;

        let floor = config.adaptive_debounce_floor_ms.max(1);
        let ceiling = config.adaptive_debounce_ceiling_ms.max(floor);
        let target = config.adaptive_target_batch.max(1) as u64;
        let step = (ceiling - floor).div_ceil(8).max(1);

        if self.ewma_batch > target {
            self.debounce_ms = self.debounce_ms.saturating_sub(step).max(floor);
            return;
        }
        if self.ewma_batch <= target / 4 {
            self.debounce_ms = self.debounce_ms.saturating_add(step).min(ceiling);
        }
    }

    pub(super) fn current_debounce_ms(&self) -> u64 {
        self.debounce_ms
    }
}

#[cfg(test)]
mod tests {
    use super::AdaptiveFlushState;
    use crate::config::SyncConfig;
    use std::time::Duration;

    #[test]
    fn disabled_adaptation_keeps_configured_debounce() {
        let config = SyncConfig::default();
        let mut state = AdaptiveFlushState::from_config(&config);
        for _ in 0..32 {
            state.observe_flush(&config, 10_000);
        }
        assert_eq!(state.debounce(&config), Duration::from_millis(150));
    }

    #[test]
    fn sustained_large_batches_shrink_debounce_to_floor() {
        let config = SyncConfig::high_frequency();
        let mut state = AdaptiveFlushState::from_config(&config);
        for _ in 0..200 {
            state.observe_flush(&config, 1_000);
        }
        assert_eq!(state.current_debounce_ms(), config.adaptive_debounce_floor_ms);
    }

    #[test]
    fn quiet_periods_relax_debounce_back_to_ceiling() {
        let config = SyncConfig::high_frequency();
        let mut state = AdaptiveFlushState::from_config(&config);
        for _ in 0..200 {
            state.observe_flush(&config, 1_000);
        }
        for _ in 0..200 {
            state.observe_flush(&config, 1);
        }
        assert_eq!(
            state.debounce(&config),
            Duration::from_millis(config.adaptive_debounce_ceiling_ms)
        );
    }
}
