//! Collector configuration.

/// Tuning knobs for a collector instance.
///
/// All fields have safe defaults; none are required for correctness.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Registry growth threshold: the table doubles once
    /// `occupied / capacity` would exceed this ratio (default: 0.9).
    pub load_factor: f64,
    /// Registry shrink threshold: after a sweep the table halves while
    /// `occupied / capacity` is below this ratio (default: 0.5).
    pub sweep_factor: f64,
    /// Smallest slot-array capacity the registry will shrink to
    /// (default: 32).
    pub min_capacity: usize,
    /// Post-sweep growth multiplier for the auto-collection threshold:
    /// the next collection triggers once the live count exceeds
    /// `live + live * trigger_factor + 1` (default: 0.5).
    pub trigger_factor: f64,
    /// Live-count threshold for the very first automatic collection
    /// (default: 8), kept small so the first cycle runs early in a
    /// workload.
    pub initial_trigger: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            load_factor: 0.9,
            sweep_factor: 0.5,
            min_capacity: 32,
            trigger_factor: 0.5,
            initial_trigger: 8,
        }
    }
}
