//! Vigil is a runtime security monitor for Kubernetes workloads.
//! At high level it provides two components:
//!
//! - a [node agent](crate::node_agent) running on every node: it traces process
//!   executions with eBPF, maps them to the pods running them and validates them
//!   against the process allowlists (constraints) of those pods
//! - a [cluster agent](crate::cluster_agent) running once per cluster: it relays
//!   configuration and events between the node agents and the central server,
//!   receives Falco alerts and enforces the remediation actions
//!
//! The two components are provided as separate binaries: `vigil-node-agent` and
//! `vigil-cluster-agent`. Both read their configuration from an INI file, see
//! [`config::VigilConfig`].
//!
//! ```sh
//! # On every node, usually from a DaemonSet
//! vigil-node-agent --config-file /etc/vigil/vigil.ini
//!
//! # Once per cluster
//! vigil-cluster-agent -v
//! ```

pub mod cli;
pub mod cluster_agent;
pub mod config;
pub mod node_agent;
pub mod utils;

pub mod metadata {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder().filter_level(level_filter).init();
    }
}
