use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::agent::AgentArgs;
use crate::config::agent::SmcrInitArgs;
use crate::config::controller::ControllerArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the cluster controller that allocates ERIs for nodes
    Controller(Box<ControllerArgs>),
    /// Run the node agent that installs the driver and serves eRDMA devices
    Agent(Box<AgentArgs>),
    /// Bind eth0 of the current network namespace to the SMC-R pnet
    #[command(name = "smcr-init")]
    SmcrInit(SmcrInitArgs),
}
