//! Node agent: installs the driver, probes the node's eRDMA devices and
//! serves them to kubelet.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use api_types::Capabilities;
use api_types::DeviceInfo;
use api_types::ERdmaDeviceInfo;
use api_types::Eri;
use tracing::info;

use crate::app::into_anyhow;
use crate::app::Tasks;
use crate::config::AgentArgs;
use crate::device_plugin::api::DevicePluginOptions;
use crate::device_plugin::rdma_cm_available;
use crate::device_plugin::runtime;
use crate::device_plugin::ErdmaDevicePlugin;
use crate::device_plugin::PluginState;
use crate::driver::discovery::select_local_eris;
use crate::driver::discovery::ExposedEris;
use crate::driver::exec::Shell;
use crate::driver::exec::SystemShell;
use crate::driver::netdev::IpRoute2;
use crate::driver::probe::HostPaths;
use crate::driver::smc;
use crate::driver::DriverRegistry;
use crate::driver::ERdmaDriver;
use crate::k8s::device_object::wait_for_node_device;
use crate::k8s::kube_client::init_kube_client;
use crate::metadata::MetadataClient;

mod diagnostics;

const WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Root of the host filesystem as mounted into the agent.
const HOST_ROOT: &str = "/proc/1/root";

/// ERIs this node should serve, and whether every device must be granted to
/// every container.
async fn node_eris(args: &AgentArgs, metadata: &MetadataClient) -> Result<(Vec<DeviceInfo>, bool)> {
    if !args.local_eri_discovery {
        let client = init_kube_client(args.kubeconfig.as_deref())
            .await
            .map_err(into_anyhow)?;
        let device = wait_for_node_device(&client, &args.node_name, args.wait_attempts, WAIT_INTERVAL)
            .await
            .map_err(into_anyhow)?;
        return Ok((device.spec.devices, args.allocate_all_devices));
    }

    let exposed = ExposedEris::parse(&args.exposed_local_eris).map_err(into_anyhow)?;
    let mut allocate_all = args.allocate_all_devices;
    if !exposed.is_empty() {
        info!("LocalERIDiscovery: enable expose ERIs, set allocAllDevices to true");
        allocate_all = true;
    }
    let instance_id = metadata.instance_id().await.map_err(into_anyhow)?;
    let eris = select_local_eris(&HostPaths::default(), &instance_id, &exposed)
        .map_err(into_anyhow)
        .context("LocalERIDiscovery: select eri failed")?;
    Ok((eris.iter().map(DeviceInfo::from).collect(), allocate_all))
}

pub async fn run(args: AgentArgs) -> Result<()> {
    info!(node = %args.node_name, local_eri_discovery = args.local_eri_discovery, "agent starting");
    let mut tasks = Tasks::new();
    tasks.spawn("diagnostics", diagnostics::dump_on_signal);

    let shell = Arc::new(SystemShell);
    let metadata = Arc::new(MetadataClient::new().map_err(into_anyhow)?);
    let (devices, allocate_all) = node_eris(&args, &metadata).await?;

    let kind = DriverRegistry::for_platform()
        .select(&args.prefer_driver, shell.as_ref())
        .await
        .map_err(into_anyhow)?;
    info!(devices = ?devices, driver = %kind, "eri info");

    let driver = ERdmaDriver::new(
        kind,
        Arc::clone(&shell),
        HostPaths::default(),
        Arc::new(IpRoute2::new(Arc::clone(&shell))),
        metadata,
    );
    driver
        .install()
        .await
        .map_err(into_anyhow)
        .context("install eri driver failed")?;

    let mut probed: Vec<ERdmaDeviceInfo> = Vec::with_capacity(devices.len());
    for device in &devices {
        let info = driver
            .probe_device(&Eri::from(device))
            .await
            .map_err(into_anyhow)
            .with_context(|| format!("probe device {} failed", device.id))?;
        probed.push(info);
    }
    info!(devices = ?probed, "eri device info");

    for device in probed.iter().filter(|d| d.capabilities.contains(Capabilities::SMC_R)) {
        smc::config_smc_pnet_for_device(shell.as_ref(), device)
            .await
            .map_err(into_anyhow)
            .context("config smc pnet for device failed")?;
    }

    let runtime = if args.device_plugin_prestart_container {
        Some(
            runtime::connect(args.runtime_sock.as_deref())
                .await
                .map_err(into_anyhow)?,
        )
    } else {
        None
    };
    let options = DevicePluginOptions {
        pre_start_required: args.device_plugin_prestart_container,
        get_preferred_allocation_available: false,
    };
    let shell: Arc<dyn Shell> = shell;
    let state = PluginState::new(
        probed,
        options,
        allocate_all,
        rdma_cm_available(kind, Path::new(HOST_ROOT)),
        shell,
        runtime,
    );
    let plugin = ErdmaDevicePlugin::new(state);
    tasks.spawn_fallible("device-plugin", |token| async move {
        plugin.serve(token).await.map_err(into_anyhow)
    });

    tasks.wait_for_completion().await
}
