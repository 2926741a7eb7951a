//! Node agent: exec probe, pod correlation and process validation.
//!
//! ```text
//! exec probe -> records -> correlator -> exec events -> validator -> cluster agent
//!                              ^                            ^
//!                          pod index                 constraint cache
//! ```

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, ensure};
use bpf_common::debugfs;
use engine_api::client::EngineApiClient;
use exec_monitor::{Correlator, ExecSource};
use kube_client::{KubeClient, KubeConfig, PodIndex, pod_index};
use nix::unistd::geteuid;
use process_validator::{EventReporter, ProcessValidator};
use tokio::sync::mpsc;
use vigil_core::{
    PolicyCache,
    pdk::{ConfigError, ModuleConfig, ModuleName, ShutdownSignal},
};

use crate::{
    cli::AgentOpts,
    config::{KUBERNETES_SECTION, NODE_AGENT_SECTION, VigilConfig},
    utils,
};

const POD_INDEX: ModuleName = "pod-index";
const CONSTRAINT_SYNC: ModuleName = "constraint-sync";

const DEFAULT_CLUSTER_AGENT_URL: &str = "http://vigil-cluster-agent:8088";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// `[node-agent]` settings not owned by a module.
#[derive(Debug, Clone)]
pub struct NodeAgentConfig {
    pub cluster_agent_url: String,
    /// Only pods scheduled on this node are indexed.
    pub node_name: String,
    pub constraint_sync_interval: Duration,
}

impl TryFrom<&ModuleConfig> for NodeAgentConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let node_name = match config.optional::<String>("node_name")? {
            Some(node_name) => node_name,
            None => std::env::var("NODE_NAME").map_err(|_| ConfigError::RequiredValue {
                field: "node_name".to_string(),
            })?,
        };

        Ok(Self {
            cluster_agent_url: config
                .with_default("cluster_agent_url", DEFAULT_CLUSTER_AGENT_URL.to_string())?,
            node_name,
            constraint_sync_interval: config
                .seconds_with_default("constraint_sync_interval_secs", Duration::from_secs(3))?,
        })
    }
}

pub async fn run(options: &AgentOpts) -> Result<()> {
    log::trace!("Node agent options: {:?}", options);

    ensure!(geteuid().is_root(), "You must run this as root user!!!");

    debugfs::check_or_mount_debug_fs()?;

    bpf_common::bump_memlock_rlimit()?;

    let config = VigilConfig::load(options.config_file.as_deref())?;
    let section = config.get_module_config(NODE_AGENT_SECTION);
    let agent_config = NodeAgentConfig::try_from(&section)?;
    let exec_config = exec_monitor::Config::try_from(&section)?;
    let validator_config = process_validator::Config::try_from(&section)?;
    let kube_config = KubeConfig::try_from(&config.get_module_config(KUBERNETES_SECTION))?;

    let client = EngineApiClient::new(&agent_config.cluster_agent_url)?;
    client
        .check_connection(CONNECT_TIMEOUT)
        .await
        .with_context(|| {
            format!(
                "Cannot reach the cluster agent at {}",
                agent_config.cluster_agent_url
            )
        })?;
    let client = Arc::new(client);
    let kube = KubeClient::new(&kube_config).context("Cannot create the Kubernetes client")?;

    let (exec_source, records) = ExecSource::start(&exec_config.probe_path)
        .await
        .with_context(|| {
            format!(
                "Cannot attach the exec probe {}",
                exec_config.probe_path.display()
            )
        })?;

    let (shutdown_sender, shutdown) = ShutdownSignal::new();
    let mut tasks = Vec::new();

    let pods = PodIndex::new(POD_INDEX);
    tasks.push(tokio::spawn(pods.clone().run(
        kube,
        Some(pod_index::node_field_selector(&agent_config.node_name)),
        kube_config.resync_interval,
        shutdown.clone(),
    )));

    let constraints = Arc::new(PolicyCache::new());
    tasks.push(tokio::spawn(process_validator::sync_constraints(
        CONSTRAINT_SYNC,
        constraints.clone(),
        client.clone(),
        agent_config.constraint_sync_interval,
        shutdown.clone(),
    )));

    let (tx_events, rx_events) = mpsc::channel(exec_monitor::QUEUE_CAPACITY);
    let correlator = Correlator::new(exec_config.host_proc_dir.clone(), pods);
    tasks.push(tokio::spawn(exec_monitor::run(
        correlator,
        records,
        tx_events,
        shutdown.clone(),
    )));

    let validator = ProcessValidator::new(
        process_validator::MODULE_NAME,
        validator_config,
        constraints,
        EventReporter::new(process_validator::MODULE_NAME, client, REPORT_TIMEOUT),
    );
    tasks.push(tokio::spawn(validator.run(rx_events, shutdown)));

    log::info!("Node agent started on {}", agent_config.node_name);

    utils::wait_for_termination().await?;

    log::info!("Terminating node agent...");
    shutdown_sender.send_signal();
    for task in tasks {
        if let Err(err) = task.await {
            log::warn!("Task didn't terminate cleanly: {err}");
        }
    }
    exec_source.close();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_name_from_config() {
        let mut section = ModuleConfig::default();
        section.insert("node_name".to_string(), "worker-1".to_string());
        section.insert(
            "constraint_sync_interval_secs".to_string(),
            "10".to_string(),
        );

        let config = NodeAgentConfig::try_from(&section).unwrap();
        assert_eq!(config.node_name, "worker-1");
        assert_eq!(config.cluster_agent_url, DEFAULT_CLUSTER_AGENT_URL);
        assert_eq!(config.constraint_sync_interval, Duration::from_secs(10));
    }

    #[test]
    fn invalid_interval_is_rejected() {
        let mut section = ModuleConfig::default();
        section.insert("node_name".to_string(), "worker-1".to_string());
        section.insert(
            "constraint_sync_interval_secs".to_string(),
            "soon".to_string(),
        );
        assert!(matches!(
            NodeAgentConfig::try_from(&section),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
