use std::time::Duration;

/// Tunables of the proximity matcher. Hot-reloadable.
#[derive(Debug, Clone, PartialEq)]
pub struct MatcherConfig {
    /// Period of the background scan.
    pub interval: Duration,
    /// Connections served per batch during a scan.
    pub batch_size: usize,
    /// Pause between two batches.
    pub batch_stagger: Duration,
    /// Applied when an alert document carries no usable radius.
    pub default_radius_meters: f64,
    /// Alerts per batch in the on-demand update after a registration.
    pub arrival_batch_size: usize,
    /// Pause between two batches of the on-demand update.
    pub arrival_stagger: Duration,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            batch_size: 10,
            batch_stagger: Duration::from_millis(100),
            default_radius_meters: 50_000.0,
            arrival_batch_size: 2,
            arrival_stagger: Duration::from_millis(500),
        }
    }
}
