use anyhow::Result;
use clap::Parser;
use vigil::cli::ClusterAgentOpts;

#[tokio::main]
async fn main() -> Result<()> {
    let opts = ClusterAgentOpts::parse();

    vigil::init_logger(opts.agent.override_log_level());

    match vigil::cluster_agent::run(&opts.agent).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            vigil::utils::report_error(&e);
            std::process::exit(1);
        }
    }
}
