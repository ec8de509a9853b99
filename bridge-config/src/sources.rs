//! Raw, unvalidated configuration from each source: environment
//! variables (`EnvConfig`) and an optional TOML file (`FileConfig`).
//! `loader.rs` composes the two.

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub vfs: FileVfsConfig,
    #[serde(default)]
    pub gateway: FileGatewayConfig,
    #[serde(default)]
    pub cors: FileCorsConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileVfsConfig {
    pub root: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileGatewayConfig {
    pub mount: Option<String>,
    pub read_only: Option<bool>,
    pub auto_index: Option<String>,
    pub no_mime: Option<bool>,
    pub enoent_as_200: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileCorsConfig {
    pub allowed_origins: Option<Vec<String>>,
}

/// Environment-derived configuration values (`spec.md` §10.4 env var
/// names).
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub vfs_root: Option<PathBuf>,
    pub mount: Option<String>,
    pub read_only: Option<bool>,
    pub auto_index: Option<String>,
    pub no_mime: Option<bool>,
    pub enoent_as_200: Option<bool>,
    pub cors_allowed_origins: Option<Vec<String>>,
    pub config_path: Option<PathBuf>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            host: std::env::var("BRIDGE_HOST").ok(),
            port: std::env::var("BRIDGE_PORT").ok().and_then(|s| s.parse().ok()),
            vfs_root: std::env::var("BRIDGE_VFS_ROOT").ok().map(PathBuf::from),
            mount: std::env::var("BRIDGE_MOUNT").ok(),
            read_only: parse_bool_var("BRIDGE_READ_ONLY"),
            auto_index: std::env::var("BRIDGE_AUTO_INDEX").ok(),
            no_mime: parse_bool_var("BRIDGE_NO_MIME"),
            enoent_as_200: parse_bool_var("BRIDGE_ENOENT_AS_200"),
            cors_allowed_origins: parse_csv_var("BRIDGE_CORS_ALLOWED_ORIGINS"),
            config_path: std::env::var("BRIDGE_CONFIG").ok().map(PathBuf::from),
        }
    }
}

fn parse_csv_var(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    })
}

fn parse_bool_var(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|raw| match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}
