// CONTEXT CONFIGURATION
// ================================================================================================

/// Per-context admission-control knobs, chosen once when the context is
/// created.
#[derive(Clone, Copy, Debug)]
pub struct ContextConfig {
    /// Maximum number of outstanding child operations before
    /// `register_new_child_operation` blocks; zero disables the window.
    pub max_window_size: usize,
    /// Percentage of the window that must drain before a blocked registration
    /// wakes up.
    pub hysteresis_percentage: usize,
    /// Maximum number of outstanding frames before `issue_frame` blocks;
    /// zero disables frame throttling.
    pub max_outstanding_frames: usize,
    /// Below this many outstanding subtasks the context is re-activated so
    /// the scheduler looks for more work.
    pub min_tasks_to_schedule: usize,
    /// Below this many outstanding frames the context is re-activated.
    pub min_frames_to_schedule: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_window_size: 1024,
            hysteresis_percentage: 25,
            max_outstanding_frames: 0,
            min_tasks_to_schedule: 32,
            min_frames_to_schedule: 0,
        }
    }
}

impl ContextConfig {
    /// The outstanding-children level at which a blocked window reopens.
    pub fn window_low_water(&self) -> usize {
        self.max_window_size * (100 - self.hysteresis_percentage) / 100
    }
}

// RUNTIME CONFIGURATION
// ================================================================================================

/// Node-wide configuration.
#[derive(Clone, Debug, Default)]
pub struct RuntimeConfig {
    /// Default configuration for new contexts; mappers may override per
    /// context.
    pub context: ContextConfig,
    /// Radix of the shard collective trees and butterfly stages.
    pub collective_radix: usize,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self { context: ContextConfig::default(), collective_radix: 2 }
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_water_uses_hysteresis() {
        let config = ContextConfig {
            max_window_size: 100,
            hysteresis_percentage: 25,
            ..ContextConfig::default()
        };
        assert_eq!(config.window_low_water(), 75);
    }
}
