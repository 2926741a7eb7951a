use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use vigil_core::pdk::{ConfigError, ModuleConfig};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Connection settings for the api server, `[kubernetes]` section.
#[derive(Debug, Clone)]
pub struct KubeConfig {
    /// Base url, e.g. `https://10.96.0.1:443`.
    pub api_server: String,
    /// Bearer token file. Read on every request, projected tokens rotate.
    pub token_file: Option<PathBuf>,
    /// PEM bundle trusted for the api server certificate.
    pub ca_file: Option<PathBuf>,
    /// Interval between full relists of the pod index.
    pub resync_interval: Duration,
}

impl TryFrom<&ModuleConfig> for KubeConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let api_server = match config.optional::<String>("api_server")? {
            Some(api_server) => api_server,
            None => in_cluster_api_server().ok_or_else(|| ConfigError::RequiredValue {
                field: "api_server".to_string(),
            })?,
        };

        Ok(Self {
            api_server: api_server.trim_end_matches('/').to_string(),
            token_file: Some(config.with_default(
                "token_file",
                Path::new(SERVICE_ACCOUNT_DIR).join("token"),
            )?),
            ca_file: Some(config.with_default(
                "ca_file",
                Path::new(SERVICE_ACCOUNT_DIR).join("ca.crt"),
            )?),
            resync_interval: config
                .seconds_with_default("resync_interval_secs", Duration::from_secs(60))?,
        })
    }
}

fn in_cluster_api_server() -> Option<String> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST").ok()?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
    // IPv6 service addresses need brackets
    if host.contains(':') {
        Some(format!("https://[{host}]:{port}"))
    } else {
        Some(format!("https://{host}:{port}"))
    }
}
