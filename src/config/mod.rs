//! Configuration system.
//!
//! TOML configuration with hierarchy merging: user config, then project
//! config, then an explicit `--config` file. Lists and maps merge,
//! scalars override, and the ordered `[filter]` rule list is replaced
//! wholesale by the highest-priority file that defines one.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{Config, ProxySection, DEFAULT_PROXY_PORT};
