//! Cluster agent: relay between node agents and the server, Falco webhook
//! and enforcement of the remediation actions.
//!
//! Events ingested through the relay or raised from Falco alerts are handed to
//! the action handler, which deletes the offending pods through the
//! Kubernetes api.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use action_handler::ActionHandler;
use anyhow::{Context, Result};
use engine_api::{
    client::EngineApiClient,
    server::{self, RelayContext},
};
use falco_listener::FalcoListener;
use kube_client::{KubeClient, KubeConfig, PodIndex};
use vigil_core::{
    PolicyCache,
    pdk::{ConfigError, ModuleConfig, ModuleName, ShutdownSignal},
};

use crate::{
    cli::AgentOpts,
    config::{CLUSTER_AGENT_SECTION, KUBERNETES_SECTION, VigilConfig},
    utils,
};

const RELAY: ModuleName = "relay";
const POD_INDEX: ModuleName = "pod-index";
const ACTION_SYNC: ModuleName = "action-sync";
const CONSTRAINT_SYNC: ModuleName = "constraint-sync";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// `[cluster-agent]` settings not owned by a module.
#[derive(Debug, Clone)]
pub struct ClusterAgentConfig {
    pub server_url: String,
    pub listen_address: SocketAddr,
    /// Let node agents add and remove constraints through the relay.
    pub enable_add_constraint: bool,
    pub constraint_sync_interval: Duration,
    pub action_sync_interval: Duration,
}

impl TryFrom<&ModuleConfig> for ClusterAgentConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            server_url: config.required("server_url")?,
            listen_address: config
                .with_default("listen_address", SocketAddr::from(([0, 0, 0, 0], 8088)))?,
            enable_add_constraint: config.with_default("enable_add_constraint", false)?,
            constraint_sync_interval: config
                .seconds_with_default("constraint_sync_interval_secs", Duration::from_secs(5))?,
            action_sync_interval: config
                .seconds_with_default("action_sync_interval_secs", Duration::from_secs(3))?,
        })
    }
}

pub async fn run(options: &AgentOpts) -> Result<()> {
    log::trace!("Cluster agent options: {:?}", options);

    let config = VigilConfig::load(options.config_file.as_deref())?;
    let section = config.get_module_config(CLUSTER_AGENT_SECTION);
    let agent_config = ClusterAgentConfig::try_from(&section)?;
    let falco_config = falco_listener::Config::try_from(&section)?;
    let kube_config = KubeConfig::try_from(&config.get_module_config(KUBERNETES_SECTION))?;

    let server = EngineApiClient::new(&agent_config.server_url)?;
    server
        .check_connection(CONNECT_TIMEOUT)
        .await
        .with_context(|| format!("Cannot reach the server at {}", agent_config.server_url))?;
    let server = Arc::new(server);
    let kube = KubeClient::new(&kube_config).context("Cannot create the Kubernetes client")?;

    let (shutdown_sender, shutdown) = ShutdownSignal::new();
    let mut tasks = Vec::new();

    let actions = Arc::new(PolicyCache::new());
    tasks.push(tokio::spawn(action_handler::sync_actions(
        ACTION_SYNC,
        actions.clone(),
        server.clone(),
        agent_config.action_sync_interval,
        shutdown.clone(),
    )));

    let constraints = Arc::new(PolicyCache::new());
    tasks.push(tokio::spawn(process_validator::sync_constraints(
        CONSTRAINT_SYNC,
        constraints.clone(),
        server.clone(),
        agent_config.constraint_sync_interval,
        shutdown.clone(),
    )));

    let pods = PodIndex::new(POD_INDEX);
    tasks.push(tokio::spawn(pods.clone().run(
        kube.clone(),
        None,
        kube_config.resync_interval,
        shutdown.clone(),
    )));

    let handler = ActionHandler::new(action_handler::MODULE_NAME, actions, kube, server.clone());
    let (action_handler, handler_task) =
        action_handler::start_action_handler(handler, shutdown.clone());
    tasks.push(handler_task);

    let relay_handle = server::run_relay_server(
        agent_config.listen_address,
        RelayContext {
            name: RELAY,
            upstream: server.clone(),
            enable_add_constraint: agent_config.enable_add_constraint,
            event_queue: Some(action_handler.sender()),
        },
    )
    .await?;

    let falco_handle = falco_listener::run_falco_listener(
        falco_config.listen_address,
        FalcoListener::new(
            falco_listener::MODULE_NAME,
            pods,
            constraints,
            server,
            action_handler.sender(),
        ),
    )
    .await?;

    log::info!("Cluster agent started");

    utils::wait_for_termination().await?;

    log::info!("Terminating the relay and the falco listener...");
    relay_handle.stop().await;
    falco_handle.stop().await;

    log::info!("Terminating cluster agent...");
    shutdown_sender.send_signal();
    for task in tasks {
        if let Err(err) = task.await {
            log::warn!("Task didn't terminate cleanly: {err}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_url_is_required() {
        assert_eq!(
            ClusterAgentConfig::try_from(&ModuleConfig::default()).unwrap_err(),
            ConfigError::RequiredValue {
                field: "server_url".to_string()
            }
        );
    }

    #[test]
    fn defaults() {
        let mut section = ModuleConfig::default();
        section.insert("server_url".to_string(), "http://vigil-server:8080".to_string());

        let config = ClusterAgentConfig::try_from(&section).unwrap();
        assert_eq!(config.listen_address, "0.0.0.0:8088".parse().unwrap());
        assert!(!config.enable_add_constraint);
        assert_eq!(config.constraint_sync_interval, Duration::from_secs(5));
        assert_eq!(config.action_sync_interval, Duration::from_secs(3));

        let falco = falco_listener::Config::try_from(&section).unwrap();
        assert_eq!(falco.listen_address, "0.0.0.0:8089".parse().unwrap());
    }
}
