//! Command line options of the agent binaries.

use clap::{ArgAction, Args, Parser};

pub const NODE_AGENT_NAME: &str = "vigil-node-agent";
pub const CLUSTER_AGENT_NAME: &str = "vigil-cluster-agent";

/// Options shared by both agents.
#[derive(Args, Debug, Clone, Default)]
pub struct AgentOpts {
    /// Configuration file, must exist when given
    #[clap(long)]
    pub config_file: Option<String>,

    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl AgentOpts {
    pub fn override_log_level(&self) -> Option<log::LevelFilter> {
        log_level_from_verbosity_flag_count(self.verbose)
    }
}

fn log_level_from_verbosity_flag_count(num: u8) -> Option<log::LevelFilter> {
    match num {
        0 => None,
        1 => Some(log::LevelFilter::Debug),
        2..=u8::MAX => Some(log::LevelFilter::Trace),
    }
}

#[derive(Parser, Debug, Clone)]
#[clap(name = NODE_AGENT_NAME)]
#[clap(about = "Vigil node agent: validates the processes started in the pods of this node")]
#[clap(version = crate::metadata::VERSION)]
#[clap(disable_help_subcommand = true)]
pub struct NodeAgentOpts {
    #[command(flatten)]
    pub agent: AgentOpts,
}

#[derive(Parser, Debug, Clone)]
#[clap(name = CLUSTER_AGENT_NAME)]
#[clap(about = "Vigil cluster agent: relays policies and events, enforces actions")]
#[clap(version = crate::metadata::VERSION)]
#[clap(disable_help_subcommand = true)]
pub struct ClusterAgentOpts {
    #[command(flatten)]
    pub agent: AgentOpts,
}
