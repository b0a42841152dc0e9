mod agent;
mod app;
mod cloud;
mod config;
mod device_plugin;
mod driver;
mod eri;
mod k8s;
mod metadata;
mod smcr_init;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use anyhow::Result;
use clap::Parser;
use utils::version;

use crate::app::into_anyhow;
use crate::app::Tasks;
use crate::cloud::ecs::EcsClient;
use crate::cloud::ecs::EndpointNetwork;
use crate::config::Cli;
use crate::config::Commands;
use crate::config::ControllerArgs;
use crate::config::ControllerConfig;
use crate::config::Credential;
use crate::eri::EriResolver;
use crate::k8s::device_reconciler;
use crate::k8s::kube_client::init_kube_client;
use crate::k8s::node_watcher::NodeWatcher;
use crate::metadata::MetadataClient;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Controller(args) => run_controller(*args).await,
        Commands::Agent(args) => run_agent(*args).await,
        Commands::SmcrInit(args) => {
            utils::logging::init();
            smcr_init::run(args).await
        }
    }
}

async fn run_controller(args: ControllerArgs) -> Result<()> {
    utils::logging::init();
    tracing::info!("Starting erdma controller {}", &**version::VERSION);

    let mut config = ControllerConfig::load(&args.config).map_err(into_anyhow)?;
    let credential = Credential::load(&args.credential).map_err(into_anyhow)?;
    if config.region.is_empty() {
        let metadata = MetadataClient::new().map_err(into_anyhow)?;
        config.region = metadata
            .region_id()
            .await
            .map_err(into_anyhow)
            .context("region is not configured and cannot be read from metadata")?;
    }
    tracing::info!(
        region = %config.region,
        manage_non_owned_eris = config.manage_non_owned_eris,
        node_selector = ?config.node_selector,
        "controller config loaded"
    );

    let network = if args.public_network {
        EndpointNetwork::Public
    } else {
        EndpointNetwork::Vpc
    };
    let ecs = EcsClient::new(&config.region, network, credential).map_err(into_anyhow)?;
    let resolver = Arc::new(EriResolver::new(Arc::new(ecs), config.manage_non_owned_eris));
    let client = init_kube_client(args.kubeconfig.as_deref())
        .await
        .map_err(into_anyhow)?;
    let requeue_after = Duration::from_secs(args.requeue_seconds);

    let mut tasks = Tasks::new();
    let watcher = Arc::new(NodeWatcher::new(
        client.clone(),
        Arc::clone(&resolver),
        config.node_selector.clone(),
        requeue_after,
    ));
    tasks.spawn_fallible("node-watcher", |token| async move {
        watcher.run(token).await.map_err(into_anyhow)
    });
    let ctx = Arc::new(device_reconciler::Context {
        client,
        resolver,
        requeue_after,
    });
    tasks.spawn("device-reconciler", |token| device_reconciler::run(ctx, token));

    tasks.wait_for_completion().await
}

async fn run_agent(args: config::AgentArgs) -> Result<()> {
    let _guard = match &args.log_dir {
        Some(dir) => Some(
            utils::logging::init_with_log_dir(dir, "erdma-agent.log")
                .with_context(|| format!("cannot log to {}", dir.display()))?,
        ),
        None => {
            utils::logging::init();
            None
        }
    };
    tracing::info!("Starting erdma agent {}", &**version::VERSION);
    agent::run(args).await
}
