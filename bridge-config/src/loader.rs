//! `ConfigLoader`: composes `EnvConfig` and an optional `FileConfig`
//! into a resolved `Config`, env winning over file winning over
//! defaults. Mirrors the rest of this family's loader: explicit path >
//! env path > default search locations; a missing-but-not-explicit file
//! is a warning, not an error.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::models::{Config, CorsConfig, GatewayConfig, ServerConfig, VfsConfig};
use crate::sources::{EnvConfig, FileConfig};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> =
    Lazy::new(|| vec![PathBuf::from("bridge.toml"), PathBuf::from("config/bridge.toml")]);

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("config file {path} was explicitly requested but does not exist")]
    MissingConfig { path: PathBuf },

    #[error("failed to read config file {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, #[source] source: toml::de::Error },
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings(pub Vec<String>);

impl ConfigWarnings {
    fn push(&mut self, message: impl Into<String>) {
        self.0.push(message.into());
    }
}

pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        match &self.options.env_file {
            Some(path) => {
                let _ = dotenvy::from_path(path);
            }
            None => {
                let _ = dotenvy::dotenv();
            }
        }

        let env_config = EnvConfig::gather();
        let mut warnings = ConfigWarnings::default();
        let file_config = self.load_file_config(&env_config, &mut warnings)?;

        Ok(ConfigLoad { config: compose(file_config, env_config), warnings })
    }

    fn load_file_config(&self, env_config: &EnvConfig, warnings: &mut ConfigWarnings) -> Result<Option<FileConfig>, ConfigLoadError> {
        let (path, explicit) = if let Some(explicit) = &self.options.config_path {
            (Some(explicit.clone()), true)
        } else if let Some(from_env) = &env_config.config_path {
            (Some(from_env.clone()), true)
        } else {
            (DEFAULT_CONFIG_LOCATIONS.iter().find(|p| p.exists()).cloned(), false)
        };

        let Some(path) = path else {
            return Ok(None);
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            warnings.push(format!("config file {} not found, using defaults", path.display()));
            return Ok(None);
        }

        Ok(Some(read_file_config(&path)?))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io { path: path.to_path_buf(), source })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse { path: path.to_path_buf(), source })
}

fn compose(file: Option<FileConfig>, env: EnvConfig) -> Config {
    let file = file.unwrap_or_default();
    let defaults = Config {
        server: ServerConfig::default(),
        vfs: VfsConfig::default(),
        gateway: GatewayConfig::default(),
        cors: CorsConfig::default(),
    };

    Config {
        server: ServerConfig {
            host: env.host.or(file.server.host).unwrap_or(defaults.server.host),
            port: env.port.or(file.server.port).unwrap_or(defaults.server.port),
        },
        vfs: VfsConfig {
            root: env.vfs_root.or(file.vfs.root).unwrap_or(defaults.vfs.root),
        },
        gateway: GatewayConfig {
            mount: env.mount.or(file.gateway.mount).unwrap_or(defaults.gateway.mount),
            read_only: env.read_only.or(file.gateway.read_only).unwrap_or(defaults.gateway.read_only),
            auto_index: env.auto_index.or(file.gateway.auto_index),
            no_mime: env.no_mime.or(file.gateway.no_mime).unwrap_or(defaults.gateway.no_mime),
            enoent_as_200: env.enoent_as_200.or(file.gateway.enoent_as_200).unwrap_or(defaults.gateway.enoent_as_200),
        },
        cors: CorsConfig {
            allowed_origins: env.cors_allowed_origins.or(file.cors.allowed_origins).unwrap_or_default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_configured() {
        // SAFETY: tests run single-threaded for env var mutation.
        unsafe {
            std::env::remove_var("BRIDGE_HOST");
            std::env::remove_var("BRIDGE_PORT");
            std::env::remove_var("BRIDGE_CONFIG");
        }
        let load = ConfigLoader::new().load().unwrap();
        assert_eq!(load.config.server.port, 8080);
        assert_eq!(load.config.gateway.mount, "/vfs/");
    }

    #[test]
    fn missing_explicit_config_path_is_an_error() {
        let loader = ConfigLoader::new().with_config_path("/does/not/exist/bridge.toml");
        assert!(matches!(loader.load(), Err(ConfigLoadError::MissingConfig { .. })));
    }

    #[test]
    fn file_config_is_read_and_env_overrides_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "[server]\nhost = \"127.0.0.1\"\nport = 9090\n").unwrap();

        unsafe {
            std::env::set_var("BRIDGE_PORT", "9999");
        }
        let load = ConfigLoader::new().with_config_path(&path).load().unwrap();
        unsafe {
            std::env::remove_var("BRIDGE_PORT");
        }

        assert_eq!(load.config.server.host, "127.0.0.1");
        assert_eq!(load.config.server.port, 9999);
    }
}
