use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tonic::transport::Channel;
use tonic::Code;
use tracing::info;

use super::pod_config_from_sandbox;
use super::PodConfig;
use super::RuntimeError;
use super::SandboxInspector;
use crate::device_plugin::pod_resources::PodRef;
use crate::device_plugin::uds_channel;

mod v1 {
    tonic::include_proto!("runtime.v1");
}

mod v1alpha2 {
    tonic::include_proto!("runtime.v1alpha2");
}

type V1Client = v1::runtime_service_client::RuntimeServiceClient<Channel>;
type V1alpha2Client = v1alpha2::runtime_service_client::RuntimeServiceClient<Channel>;

#[derive(Clone)]
enum RuntimeApi {
    V1(V1Client),
    V1alpha2(V1alpha2Client),
}

/// The parts of a listed sandbox used to find a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Sandbox {
    id: String,
    namespace: String,
    name: String,
    ready: bool,
}

impl From<v1::PodSandbox> for Sandbox {
    fn from(sandbox: v1::PodSandbox) -> Self {
        let metadata = sandbox.metadata.unwrap_or_default();
        Self {
            id: sandbox.id,
            namespace: metadata.namespace,
            name: metadata.name,
            ready: sandbox.state == v1::PodSandboxState::SandboxReady as i32,
        }
    }
}

impl From<v1alpha2::PodSandbox> for Sandbox {
    fn from(sandbox: v1alpha2::PodSandbox) -> Self {
        let metadata = sandbox.metadata.unwrap_or_default();
        Self {
            id: sandbox.id,
            namespace: metadata.namespace,
            name: metadata.name,
            ready: sandbox.state == v1alpha2::PodSandboxState::SandboxReady as i32,
        }
    }
}

#[derive(Debug, Default)]
struct SandboxStatus {
    host_network: bool,
    info: HashMap<String, String>,
}

impl From<v1::PodSandboxStatusResponse> for SandboxStatus {
    fn from(response: v1::PodSandboxStatusResponse) -> Self {
        let host_network = response
            .status
            .and_then(|s| s.linux)
            .and_then(|l| l.namespaces)
            .and_then(|n| n.options)
            .is_some_and(|o| o.network == v1::NamespaceMode::Node as i32);
        Self {
            host_network,
            info: response.info,
        }
    }
}

impl From<v1alpha2::PodSandboxStatusResponse> for SandboxStatus {
    fn from(response: v1alpha2::PodSandboxStatusResponse) -> Self {
        let host_network = response
            .status
            .and_then(|s| s.linux)
            .and_then(|l| l.namespaces)
            .and_then(|n| n.options)
            .is_some_and(|o| o.network == v1alpha2::NamespaceMode::Node as i32);
        Self {
            host_network,
            info: response.info,
        }
    }
}

/// CRI runtime service client speaking `runtime.v1`, or `runtime.v1alpha2`
/// for runtimes that do not implement v1.
#[derive(Clone)]
pub struct CriClient {
    api: RuntimeApi,
    timeout: Duration,
}

fn request_error(what: &str) -> RuntimeError {
    RuntimeError::Request {
        what: what.to_string(),
    }
}

impl CriClient {
    pub async fn connect(socket: &Path, timeout: Duration) -> Result<Self, Report<RuntimeError>> {
        let endpoint = || RuntimeError::Connect {
            endpoint: socket.display().to_string(),
        };
        let channel = tokio::time::timeout(timeout, uds_channel(socket))
            .await
            .change_context_lazy(endpoint)?
            .change_context_lazy(endpoint)?;

        let mut v1 = V1Client::new(channel.clone());
        let api = match v1.version(v1::VersionRequest::default()).await {
            Ok(_) => {
                info!("Using CRI v1 runtime API");
                RuntimeApi::V1(v1)
            }
            Err(status) if status.code() == Code::Unimplemented => {
                let mut v1alpha2 = V1alpha2Client::new(channel);
                v1alpha2
                    .version(v1alpha2::VersionRequest::default())
                    .await
                    .change_context_lazy(endpoint)?;
                info!("Using CRI v1alpha2 runtime API");
                RuntimeApi::V1alpha2(v1alpha2)
            }
            Err(status) => return Err(Report::new(status).change_context(endpoint())),
        };
        Ok(Self { api, timeout })
    }

    async fn list_sandboxes(&self) -> Result<Vec<Sandbox>, Report<RuntimeError>> {
        let call = async {
            match self.api.clone() {
                RuntimeApi::V1(mut client) => client
                    .list_pod_sandbox(v1::ListPodSandboxRequest::default())
                    .await
                    .map(|r| r.into_inner().items.into_iter().map(Sandbox::from).collect()),
                RuntimeApi::V1alpha2(mut client) => client
                    .list_pod_sandbox(v1alpha2::ListPodSandboxRequest::default())
                    .await
                    .map(|r| r.into_inner().items.into_iter().map(Sandbox::from).collect()),
            }
        };
        tokio::time::timeout(self.timeout, call)
            .await
            .change_context(request_error("list pod sandboxes"))?
            .change_context(request_error("list pod sandboxes"))
    }

    async fn sandbox_status(&self, id: &str) -> Result<SandboxStatus, Report<RuntimeError>> {
        let call = async {
            match self.api.clone() {
                RuntimeApi::V1(mut client) => client
                    .pod_sandbox_status(v1::PodSandboxStatusRequest {
                        pod_sandbox_id: id.to_string(),
                        verbose: true,
                    })
                    .await
                    .map(|r| SandboxStatus::from(r.into_inner())),
                RuntimeApi::V1alpha2(mut client) => client
                    .pod_sandbox_status(v1alpha2::PodSandboxStatusRequest {
                        pod_sandbox_id: id.to_string(),
                        verbose: true,
                    })
                    .await
                    .map(|r| SandboxStatus::from(r.into_inner())),
            }
        };
        tokio::time::timeout(self.timeout, call)
            .await
            .change_context(request_error("pod sandbox status"))?
            .change_context(request_error("pod sandbox status"))
            .attach_printable_lazy(|| format!("sandbox: {id}"))
    }
}

fn find_ready_sandbox<'a>(sandboxes: &'a [Sandbox], pod: &PodRef) -> Option<&'a Sandbox> {
    sandboxes
        .iter()
        .find(|s| s.ready && s.namespace == pod.namespace && s.name == pod.name)
}

#[async_trait]
impl SandboxInspector for CriClient {
    async fn pod_config(&self, pod: &PodRef) -> Result<PodConfig, Report<RuntimeError>> {
        let sandboxes = self.list_sandboxes().await?;
        let sandbox = find_ready_sandbox(&sandboxes, pod).ok_or_else(|| {
            Report::new(RuntimeError::SandboxNotFound {
                pod: pod.to_string(),
            })
        })?;
        let status = self.sandbox_status(&sandbox.id).await?;
        pod_config_from_sandbox(status.host_network, status.info.get("info").map(String::as_str))
            .attach_printable_lazy(|| format!("pod: {pod}"))
    }
}
