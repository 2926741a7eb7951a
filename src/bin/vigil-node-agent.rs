use anyhow::Result;
use clap::Parser;
use vigil::cli::NodeAgentOpts;

#[tokio::main]
async fn main() -> Result<()> {
    let opts = NodeAgentOpts::parse();

    vigil::init_logger(opts.agent.override_log_level());

    match vigil::node_agent::run(&opts.agent).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            vigil::utils::report_error(&e);
            std::process::exit(1);
        }
    }
}
