//! Layered configuration for the VFS access bridge binary.

pub mod loader;
pub mod models;
pub mod sources;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions, ConfigWarnings};
pub use models::{Config, CorsConfig, GatewayConfig, ServerConfig, VfsConfig};
