mod bootstrap;
pub mod config;
mod loop_runner;

pub use bootstrap::{build_region, build_server, BootstrapError, RegionWiring, ServerWiring};
pub use config::{ConfigError, RegionSettings, ServerConfig};
pub use loop_runner::run;
