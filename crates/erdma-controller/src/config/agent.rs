use std::path::PathBuf;

use clap::Parser;

use api_types::SMCR_PNET_ENV;

#[derive(Parser, Clone, Debug)]
pub struct AgentArgs {
    #[arg(long, env = "NODE_NAME", help = "Name of the node this agent runs on")]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        default_value = "",
        help = "Preferred driver: default, ofed, compat or fake (empty selects by host)"
    )]
    pub prefer_driver: String,

    #[arg(
        long,
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Grant every eRDMA device to each container"
    )]
    pub allocate_all_devices: bool,

    #[arg(
        long = "deviceplugin-prestart-container",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Ask kubelet to call PreStartContainer for SMC-R setup"
    )]
    pub device_plugin_prestart_container: bool,

    #[arg(
        long,
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Discover eRDMA devices on the node instead of reading the ERdmaDevice object"
    )]
    pub local_eri_discovery: bool,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Local ERIs to expose, each as '<instance-id> <rdma-dev>[/<rdma-dev>...]'"
    )]
    pub exposed_local_eris: Vec<String>,

    #[arg(
        long,
        default_value = "60",
        help = "Attempts (one per second) to wait for the ERdmaDevice object to be ready"
    )]
    pub wait_attempts: u32,

    #[arg(
        long,
        env = "ERDMA_LOG_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for rolling agent log files"
    )]
    pub log_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "RUNTIME_SOCK",
        value_hint = clap::ValueHint::FilePath,
        help = "Container runtime socket (defaults to probing well-known sockets)"
    )]
    pub runtime_sock: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
pub struct SmcrInitArgs {
    #[arg(
        long,
        env = SMCR_PNET_ENV,
        help = "Pnet id to bind eth0 to"
    )]
    pub pnet_id: Option<String>,
}
