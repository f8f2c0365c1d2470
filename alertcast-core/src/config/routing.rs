/// Channel derivation settings shared by the registry and the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingConfig {
    /// Country every located connection joins.
    pub country: String,
    /// How long an alert id is remembered for duplicate suppression.
    pub dedup_window: std::time::Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            country: "india".to_owned(),
            dedup_window: std::time::Duration::from_secs(10 * 60),
        }
    }
}
