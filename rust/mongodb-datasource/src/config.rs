use crate::{
    models::{AuthMethod, ConnectionScheme, ConnectionSettings, TlsOption},
    sandbox::SandboxLimits,
    schema::ValidationMode,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub sandbox: SandboxLimits,
    pub validation_mode: ValidationMode,
    pub connection: ConnectionSettings,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    listen_addr: Option<String>,
    #[serde(default)]
    listen_host: Option<String>,
    #[serde(default)]
    listen_port: Option<u16>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    request_timeout_secs: u64,
    #[serde(default = "default_sandbox_timeout_ms")]
    sandbox_timeout_ms: u64,
    #[serde(default = "default_sandbox_memory_mb")]
    sandbox_memory_mb: usize,
    #[serde(default)]
    strict_validation: bool,
    #[serde(default)]
    scheme: ConnectionScheme,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    connection_options: Option<String>,
    #[serde(default)]
    auth_method: AuthMethod,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    auth_database: Option<String>,
    #[serde(default)]
    tls: TlsOption,
    #[serde(default)]
    ca_cert_path: Option<String>,
    #[serde(default)]
    client_cert_key_path: Option<String>,
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_sandbox_timeout_ms() -> u64 {
    2000
}

const fn default_sandbox_memory_mb() -> usize {
    32
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig = envy::prefixed("MONGODB_DS_")
            .from_env()
            .context("failed to parse MONGODB_DS_* environment variables")?;

        let listen_addr = resolve_addr(raw.listen_addr, raw.listen_host, raw.listen_port)?;

        let host = raw
            .host
            .filter(|host| !host.trim().is_empty())
            .context("MONGODB_DS_HOST must be set")?;
        let database = raw
            .database
            .filter(|database| !database.trim().is_empty())
            .context("MONGODB_DS_DATABASE must be set")?;

        Ok(Self {
            listen_addr,
            api_key: raw.api_key.filter(|key| !key.is_empty()),
            request_timeout: Duration::from_secs(raw.request_timeout_secs.max(1)),
            sandbox: SandboxLimits {
                timeout: Duration::from_millis(raw.sandbox_timeout_ms.max(1)),
                memory_limit_bytes: raw.sandbox_memory_mb.max(1) * 1024 * 1024,
                ..SandboxLimits::default()
            },
            validation_mode: if raw.strict_validation {
                ValidationMode::Strict
            } else {
                ValidationMode::Shape
            },
            connection: ConnectionSettings {
                scheme: raw.scheme,
                host,
                database,
                connection_options: raw.connection_options.unwrap_or_default(),
                auth_method: raw.auth_method,
                username: raw.username,
                password: raw.password,
                auth_database: raw.auth_database,
                tls: raw.tls,
                ca_cert_path: raw.ca_cert_path,
                client_cert_key_path: raw.client_cert_key_path,
            },
        })
    }

    /// Local defaults that never read the environment.
    pub fn for_tests() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            api_key: None,
            request_timeout: Duration::from_secs(default_timeout_secs()),
            sandbox: SandboxLimits::default(),
            validation_mode: ValidationMode::Shape,
            connection: ConnectionSettings {
                host: "localhost:27017".to_string(),
                database: "test".to_string(),
                ..ConnectionSettings::default()
            },
        }
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid MONGODB_DS_LISTEN_ADDR value")?
            .next()
            .context("MONGODB_DS_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    format!("{host}:{port}")
        .to_socket_addrs()
        .context("invalid listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
