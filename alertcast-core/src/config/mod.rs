//! Runtime configuration types.
//!
//! These are the validated values the processors run with. Parsing the TOML
//! file and applying CLI overrides happens in the server crate.

mod alerts;
mod bus;
mod config_store;
mod matcher;
mod routing;

pub use alerts::AlertSourceConfig;
pub use bus::{BackboneKind, BusConfig};
pub use config_store::{ConfigStore, ConfigWatcher};
pub use matcher::MatcherConfig;
pub use routing::RoutingConfig;
