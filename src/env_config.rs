//! Process environment and file configuration.
//!
//! Exactly three environment variables are part of the interface:
//! `HOME_DIR` (client state root), `CONFIG_PATH` and `DEBUG`. Everything
//! else comes from the typed config document `CONFIG_PATH` points at.

use std::net::SocketAddr;
use std::path::PathBuf;

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

use drawbridge_domain::cluster::ClusterName;
use drawbridge_domain::resource::{HostRole, LockingMode};
use drawbridge_domain::{GatewayError, GatewayResult};

#[derive(Serialize, Deserialize, Debug)]
pub struct EnvConfig {
    /// Client state root
    pub home_dir: PathBuf,
    /// Path to the JSON config document
    pub config_path: Option<PathBuf>,
    pub debug: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            home_dir: PathBuf::from("/var/lib/drawbridge"),
            config_path: None,
            debug: false,
        }
    }
}

impl EnvConfig {
    pub fn load() -> Self {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::raw().only(&["home_dir", "config_path", "debug"]))
            .extract()
            .unwrap_or_default()
    }
}

/// A static join token from the config document
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct StaticTokenConfig {
    pub name: String,
    pub secret: String,
    pub roles: Vec<HostRole>,
}

/// The typed configuration document
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct GatewayConfig {
    pub cluster_name: ClusterName,
    /// The multi-protocol proxy port
    pub listen_addr: SocketAddr,
    /// Public hostname used for server certificates
    pub hostname: String,
    #[serde(default)]
    pub proxy_protocol: bool,
    #[serde(default)]
    pub locking_mode: LockingMode,
    #[serde(default)]
    pub static_tokens: Vec<StaticTokenConfig>,
    /// Name this proxy announces in discovery requests
    #[serde(default)]
    pub proxy_name: Option<String>,
}

impl GatewayConfig {
    pub fn load(env: &EnvConfig) -> GatewayResult<Self> {
        let config = match &env.config_path {
            Some(path) => {
                let raw = std::fs::read(path).map_err(|err| {
                    GatewayError::BadParameter(format!("config {}: {err}", path.display()))
                })?;
                serde_json::from_slice(&raw).map_err(|err| {
                    GatewayError::BadParameter(format!("config {}: {err}", path.display()))
                })?
            }
            None => Self::default(),
        };
        config.check_and_set_defaults()
    }

    pub fn check_and_set_defaults(mut self) -> GatewayResult<Self> {
        if self.hostname.is_empty() {
            self.hostname = hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok())
                .unwrap_or_else(|| "drawbridge".to_string());
        }
        if self.proxy_name.is_none() {
            self.proxy_name = Some(self.hostname.clone());
        }
        for token in &self.static_tokens {
            if token.secret.len() < 8 {
                return Err(GatewayError::BadParameter(format!(
                    "static token {:?} is too short",
                    token.name
                )));
            }
        }
        Ok(self)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cluster_name: "drawbridge.local"
                .parse()
                .expect("default cluster name is valid"),
            listen_addr: "0.0.0.0:3080".parse().expect("static addr"),
            hostname: String::new(),
            proxy_protocol: false,
            locking_mode: LockingMode::default(),
            static_tokens: vec![],
            proxy_name: None,
        }
    }
}
