//! The resolved configuration the server binary runs with. Struct-per-
//! concern, the same flat layout the rest of this family of servers
//! uses for its `Config`.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub vfs: VfsConfig,
    pub gateway: GatewayConfig,
    pub cors: CorsConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

#[derive(Debug, Clone)]
pub struct VfsConfig {
    pub root: PathBuf,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self { root: PathBuf::from(".") }
    }
}

/// Recognized mount options (`spec.md` §6.4).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub mount: String,
    pub read_only: bool,
    pub auto_index: Option<String>,
    pub no_mime: bool,
    /// §9 open question: `ENOENT` → 200 is the literal behavior but
    /// surprising; exposed as a flag rather than baked in.
    pub enoent_as_200: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mount: "/vfs/".to_string(),
            read_only: false,
            auto_index: None,
            no_mime: false,
            enoent_as_200: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}
