//! Configuration library for vigil.
//!
//! Settings come from an optional TOML file, a `.env` file and process
//! environment variables, in increasing order of precedence. The result is
//! one immutable [`Config`] built at startup and passed by reference to
//! everything that needs it.

pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::sources::{EnvConfig, FileConfig};
pub use models::{Config, ConfigMetadata, ServerConfig};
pub use validation::{ConfigWarning, ConfigWarnings};
