use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use api_types::ERdmaDeviceInfo;
use api_types::SMCR_PNET_ENV;
use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::api::device_plugin_server::DevicePlugin;
use super::api::AllocateRequest;
use super::api::AllocateResponse;
use super::api::ContainerAllocateRequest;
use super::api::ContainerAllocateResponse;
use super::api::Device;
use super::api::DevicePluginOptions;
use super::api::DeviceSpec;
use super::api::Empty;
use super::api::ListAndWatchResponse;
use super::api::NumaNode;
use super::api::PreStartContainerRequest;
use super::api::PreStartContainerResponse;
use super::api::PreferredAllocationRequest;
use super::api::PreferredAllocationResponse;
use super::api::TopologyInfo;
use super::pod_resources;
use super::runtime::SandboxInspector;
use super::DevicePluginError;
use super::RDMA_CM_DEVICE;
use crate::driver::exec::Shell;
use crate::driver::smc;

/// Each physical device is advertised as this many slots.
pub const SLOTS_PER_DEVICE: usize = 200;
const HEALTHY: &str = "Healthy";
const ADVERTISE_INTERVAL: Duration = Duration::from_secs(5);

const ENSURE_PROC_SYS_RW: &str =
    "mount | grep ' /proc/sys ' | grep rw || mount -o remount,rw /proc/sys";
const SMCR_SYSCTLS: [&str; 2] = ["net.smc.tcp2smc=1", "net.ipv6.conf.all.disable_ipv6=1"];

/// State shared by every server instance of one agent run.
pub struct PluginState {
    pub devices: BTreeMap<String, ERdmaDeviceInfo>,
    pub options: DevicePluginOptions,
    pub allocate_all: bool,
    pub rdma_cm: bool,
    pub shell: Arc<dyn Shell>,
    pub runtime: Option<Arc<dyn SandboxInspector>>,
    pub pod_resources_socket: PathBuf,
    /// Physical devices granted by the allocate request in flight.
    allocation: Mutex<HashSet<String>>,
}

impl PluginState {
    pub fn new(
        devices: Vec<ERdmaDeviceInfo>,
        options: DevicePluginOptions,
        allocate_all: bool,
        rdma_cm: bool,
        shell: Arc<dyn Shell>,
        runtime: Option<Arc<dyn SandboxInspector>>,
    ) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.name.clone(), d)).collect(),
            options,
            allocate_all,
            rdma_cm,
            shell,
            runtime,
            pod_resources_socket: PathBuf::from(pod_resources::POD_RESOURCES_SOCKET),
            allocation: Mutex::new(HashSet::new()),
        }
    }

    /// The physical device behind a `<device>/<slot>` id.
    fn device_for_slot(&self, id: &str) -> Option<&ERdmaDeviceInfo> {
        let (name, _) = id.split_once('/')?;
        self.devices.get(name)
    }
}

/// Every device replicated into its slots, pinned to the device's NUMA node.
pub(crate) fn advertised_devices(devices: &BTreeMap<String, ERdmaDeviceInfo>) -> Vec<Device> {
    devices
        .values()
        .flat_map(|d| {
            (0..SLOTS_PER_DEVICE).map(move |slot| Device {
                id: format!("{}/{slot}", d.name),
                health: HEALTHY.to_string(),
                topology: Some(TopologyInfo {
                    nodes: vec![NumaNode { id: d.numa }],
                }),
            })
        })
        .collect()
}

fn device_spec(path: &str) -> DeviceSpec {
    DeviceSpec {
        container_path: path.to_string(),
        host_path: path.to_string(),
        permissions: "rw".to_string(),
    }
}

/// Builds one response per container. A physical device is granted at most
/// once per request; requests are served one at a time.
pub(crate) async fn allocate_containers(
    state: &PluginState,
    requests: &[ContainerAllocateRequest],
) -> Vec<ContainerAllocateResponse> {
    let mut occupied = state.allocation.lock().await;
    occupied.clear();
    let responses = requests
        .iter()
        .map(|request| {
            let picked: Vec<&ERdmaDeviceInfo> = if state.allocate_all {
                state
                    .devices
                    .values()
                    .filter(|d| occupied.insert(d.name.clone()))
                    .collect()
            } else {
                request
                    .devices_ids
                    .iter()
                    .filter_map(|id| state.device_for_slot(id))
                    .filter(|d| occupied.insert(d.name.clone()))
                    .collect()
            };

            let mut paths: Vec<&str> = picked
                .iter()
                .flat_map(|d| d.dev_paths.iter().map(String::as_str))
                .collect();
            if state.rdma_cm {
                paths.push(RDMA_CM_DEVICE);
            }
            let mut seen = HashSet::new();
            paths.retain(|p| seen.insert(*p));

            // pnet of the first granted device, not the last one
            let envs = picked
                .first()
                .map(|d| HashMap::from([(SMCR_PNET_ENV.to_string(), d.pnet_id())]))
                .unwrap_or_default();
            ContainerAllocateResponse {
                envs,
                mounts: Vec::new(),
                devices: paths.into_iter().map(device_spec).collect(),
                annotations: HashMap::new(),
                cdi_devices: Vec::new(),
            }
        })
        .collect();
    responses
}

fn into_status(report: Report<DevicePluginError>) -> Status {
    error!("pre-start container failed: {report:?}");
    let message = report.current_context().to_string();
    match report.current_context() {
        DevicePluginError::PodNotFound { .. } => Status::not_found(message),
        _ => Status::internal(message),
    }
}

/// DevicePlugin service of one server instance. Streams end when `stop`
/// fires.
pub struct DevicePluginService {
    state: Arc<PluginState>,
    stop: CancellationToken,
}

impl DevicePluginService {
    pub fn new(state: Arc<PluginState>, stop: CancellationToken) -> Self {
        Self { state, stop }
    }

    /// Turns on SMC-R inside the pod's network namespace when the pod asks
    /// for it.
    async fn prepare_pod(&self, device_ids: &[String]) -> Result<(), Report<DevicePluginError>> {
        let Some(first) = device_ids.first() else {
            return Ok(());
        };
        let pod = pod_resources::pod_for_device(&self.state.pod_resources_socket, first)
            .await?
            .ok_or_else(|| {
                Report::new(DevicePluginError::PodNotFound {
                    device: first.clone(),
                })
            })?;
        let runtime = self
            .state
            .runtime
            .as_ref()
            .ok_or_else(|| Report::new(DevicePluginError::Runtime))
            .attach_printable("no container runtime connected")?;
        let config = runtime
            .pod_config(&pod)
            .await
            .change_context(DevicePluginError::Runtime)
            .attach_printable_lazy(|| format!("pod: {pod}"))?;
        if !config.smcr {
            debug!(%pod, "pod did not ask for smc-r");
            return Ok(());
        }

        let shell = self.state.shell.as_ref();
        shell
            .container(ENSURE_PROC_SYS_RW)
            .await
            .change_context(DevicePluginError::Smcr)?;
        let ns_arg = smc::netns_arg(&config.netns);
        for sysctl in SMCR_SYSCTLS {
            shell
                .command("nsenter", &[&ns_arg, "sysctl", "-w", sysctl])
                .await
                .change_context(DevicePluginError::Smcr)?;
        }

        let device = device_ids
            .iter()
            .find_map(|id| self.state.device_for_slot(id))
            .ok_or_else(|| Report::new(DevicePluginError::Smcr))
            .attach_printable_lazy(|| format!("no known device in {device_ids:?}"))?;
        smc::config_for_netns_net_device(shell, &device.pnet_id(), "eth0", &config.netns)
            .await
            .change_context(DevicePluginError::Smcr)?;
        info!(%pod, netns = %config.netns, device = %device.name, "smc-r enabled for pod");
        Ok(())
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        Ok(Response::new(self.state.options))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to advertise erdma devices");

        let (tx, rx) = mpsc::unbounded_channel();
        let devices = advertised_devices(&self.state.devices);
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ADVERTISE_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let response = ListAndWatchResponse { devices: devices.clone() };
                        if let Err(e) = tx.send(Ok(response)) {
                            error!("error send device information: {e}");
                            break;
                        }
                    }
                }
            }
            info!("device advertisement stopped");
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        Err(Status::unimplemented("unsupported"))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let request = request.into_inner();
        info!("Request Containers: {:?}", request.container_requests);

        let container_responses =
            allocate_containers(&self.state, &request.container_requests).await;
        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        let request = request.into_inner();
        info!("Prestart Request Devices: {:?}", request.devices_ids);
        self.prepare_pod(&request.devices_ids)
            .await
            .map_err(into_status)?;
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use api_types::Capabilities;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::driver::exec::fake::FakeShell;

    fn device(name: &str, mac: &str, numa: i64) -> ERdmaDeviceInfo {
        ERdmaDeviceInfo {
            name: name.to_string(),
            mac: mac.to_string(),
            dev_paths: vec![
                format!("/dev/infiniband/uverbs{}", &name[name.len() - 1..]),
                RDMA_CM_DEVICE.to_string(),
            ],
            numa,
            capabilities: Capabilities::VERBS,
        }
    }

    fn state(allocate_all: bool, rdma_cm: bool) -> PluginState {
        PluginState::new(
            vec![
                device("erdma_0", "00:16:3e:00:00:01", 0),
                device("erdma_1", "00:16:3e:00:00:02", 1),
            ],
            DevicePluginOptions::default(),
            allocate_all,
            rdma_cm,
            Arc::new(FakeShell::default()),
            None,
        )
    }

    fn request(ids: &[&str]) -> ContainerAllocateRequest {
        ContainerAllocateRequest {
            devices_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn host_paths(response: &ContainerAllocateResponse) -> Vec<&str> {
        response.devices.iter().map(|d| d.host_path.as_str()).collect()
    }

    #[test]
    fn every_device_is_advertised_in_slots() {
        let state = state(false, false);
        let devices = advertised_devices(&state.devices);
        assert_eq!(devices.len(), 2 * SLOTS_PER_DEVICE);
        assert_eq!(devices[0].id, "erdma_0/0");
        assert_eq!(devices[SLOTS_PER_DEVICE].id, "erdma_1/0");
        assert_eq!(devices[SLOTS_PER_DEVICE].topology.as_ref().unwrap().nodes[0].id, 1);
        assert!(devices.iter().all(|d| d.health == "Healthy"));
    }

    #[tokio::test]
    async fn slots_of_one_device_are_granted_once_per_request() {
        let state = state(false, true);
        let responses = allocate_containers(
            &state,
            &[request(&["erdma_0/1", "erdma_0/7"]), request(&["erdma_0/2"])],
        )
        .await;
        assert_eq!(responses.len(), 2);
        assert_eq!(
            host_paths(&responses[0]),
            vec!["/dev/infiniband/uverbs0", "/dev/infiniband/rdma_cm"]
        );
        assert_eq!(responses[0].envs[SMCR_PNET_ENV], "00163E000001");
        assert!(responses[0].devices.iter().all(|d| d.permissions == "rw"));

        // device already taken by the first container
        assert_eq!(host_paths(&responses[1]), vec!["/dev/infiniband/rdma_cm"]);
        assert!(responses[1].envs.is_empty());
    }

    #[tokio::test]
    async fn allocate_all_grants_every_device() {
        let state = state(true, false);
        let responses = allocate_containers(&state, &[request(&["erdma_1/0"])]).await;
        assert_eq!(
            host_paths(&responses[0]),
            vec![
                "/dev/infiniband/uverbs0",
                "/dev/infiniband/rdma_cm",
                "/dev/infiniband/uverbs1",
            ]
        );
        assert_eq!(responses[0].envs[SMCR_PNET_ENV], "00163E000001");
    }

    #[tokio::test]
    async fn unknown_slots_are_skipped() {
        let state = state(false, false);
        let responses = allocate_containers(&state, &[request(&["mlx5_0/1", "erdma_0"])]).await;
        assert_eq!(responses.len(), 1);
        assert!(responses[0].devices.is_empty());
        assert!(responses[0].envs.is_empty());
    }

    #[tokio::test]
    async fn granted_devices_are_tracked_per_request() {
        let state = state(false, false);
        let first = allocate_containers(&state, &[request(&["erdma_0/1"])]).await;
        assert_eq!(host_paths(&first[0]), vec!["/dev/infiniband/uverbs0", "/dev/infiniband/rdma_cm"]);
        assert_eq!(
            *state.allocation.lock().await,
            HashSet::from(["erdma_0".to_string()])
        );

        // a new request starts from a clean slate
        let second = allocate_containers(&state, &[request(&["erdma_0/2", "erdma_1/0"])]).await;
        assert_eq!(
            host_paths(&second[0]),
            vec![
                "/dev/infiniband/uverbs0",
                "/dev/infiniband/rdma_cm",
                "/dev/infiniband/uverbs1",
            ]
        );
        assert_eq!(second[0].envs[SMCR_PNET_ENV], "00163E000001");
        assert_eq!(
            *state.allocation.lock().await,
            HashSet::from(["erdma_0".to_string(), "erdma_1".to_string()])
        );
    }

    #[test_log::test(tokio::test)]
    async fn prestart_without_devices_is_a_no_op() {
        let service = DevicePluginService::new(Arc::new(state(false, false)), CancellationToken::new());
        service.prepare_pod(&[]).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn advertisement_stream_ends_on_stop() {
        use futures::StreamExt;

        let stop = CancellationToken::new();
        let service = DevicePluginService::new(Arc::new(state(false, false)), stop.clone());
        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.devices.len(), 2 * SLOTS_PER_DEVICE);

        stop.cancel();
        assert!(stream.next().await.is_none());
    }
}
