//! Pod sandbox inspection through the container runtime.
//!
//! The CRI runtime service is tried first. When the node still runs the
//! dockershim, sandbox details come from the Docker Engine API instead.

use core::error::Error;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use api_types::POD_ANNOTATION_SMCR;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use tracing::info;
use tracing::warn;

mod cri;
mod docker;

pub use cri::CriClient;
pub use docker::DockerClient;

use super::pod_resources::PodRef;

pub const DOCKERSHIM_SOCKET: &str = "/var/run/dockershim.sock";

/// Probed in order when no socket is configured.
pub const RUNTIME_ENDPOINTS: [&str; 4] = [
    DOCKERSHIM_SOCKET,
    "/run/containerd/containerd.sock",
    "/run/k3s/containerd/containerd.sock",
    "/var/run/cri-dockerd.sock",
];

pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Network namespace of the host itself.
const HOST_NETNS: &str = "/proc/1/ns/net";

#[derive(Debug, derive_more::Display)]
pub enum RuntimeError {
    #[display("Cannot find runtime socket {endpoint}")]
    MissingSocket { endpoint: String },
    #[display("Failed to connect to runtime at {endpoint}")]
    Connect { endpoint: String },
    #[display("Cannot find a valid runtime socket in {candidates}")]
    NoEndpoint { candidates: String },
    #[display("Runtime request failed: {what}")]
    Request { what: String },
    #[display("Pod sandbox of {pod} not found")]
    SandboxNotFound { pod: String },
    #[display("Unexpected pod sandbox: {message}")]
    InvalidSandbox { message: String },
}

impl Error for RuntimeError {}

/// What the pre-start hook needs to know about a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodConfig {
    /// network namespace path, as seen from the host
    pub netns: String,
    /// pod asked for SMC-R through its annotation
    pub smcr: bool,
}

#[async_trait]
pub trait SandboxInspector: Send + Sync + 'static {
    async fn pod_config(&self, pod: &PodRef) -> Result<PodConfig, Report<RuntimeError>>;
}

/// Connects to the runtime at `configured`, or to the first well-known
/// socket that answers.
pub async fn connect(
    configured: Option<&Path>,
) -> Result<Arc<dyn SandboxInspector>, Report<RuntimeError>> {
    if let Some(sock) = configured {
        if !tokio::fs::try_exists(sock).await.unwrap_or(false) {
            return Err(Report::new(RuntimeError::MissingSocket {
                endpoint: sock.display().to_string(),
            }));
        }
        let cri = CriClient::connect(sock, REQUEST_TIMEOUT).await?;
        return Ok(inspector_for(sock, cri));
    }

    for candidate in RUNTIME_ENDPOINTS {
        let sock = Path::new(candidate);
        if !tokio::fs::try_exists(sock).await.unwrap_or(false) {
            continue;
        }
        match CriClient::connect(sock, REQUEST_TIMEOUT).await {
            Ok(cri) => return Ok(inspector_for(sock, cri)),
            Err(e) => warn!(endpoint = candidate, "runtime endpoint unusable: {e:?}"),
        }
    }
    Err(Report::new(RuntimeError::NoEndpoint {
        candidates: RUNTIME_ENDPOINTS.join(","),
    }))
}

fn inspector_for(sock: &Path, cri: CriClient) -> Arc<dyn SandboxInspector> {
    if sock == Path::new(DOCKERSHIM_SOCKET) {
        let docker = docker_socket();
        info!(socket = %docker.display(), "dockershim detected, inspecting sandboxes through docker");
        return Arc::new(DockerClient::new(docker));
    }
    info!(socket = %sock.display(), "inspecting sandboxes through CRI");
    Arc::new(cri)
}

/// `DOCKER_HOST` when it names a unix socket, the default socket otherwise.
fn docker_socket() -> PathBuf {
    std::env::var("DOCKER_HOST")
        .ok()
        .and_then(|host| host.strip_prefix("unix://").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(docker::DEFAULT_DOCKER_SOCKET))
}

/// Boolean spellings accepted in the SMC-R annotation.
pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Default, Deserialize)]
struct SandboxInfo {
    #[serde(default)]
    config: SandboxConfig,
    #[serde(default, rename = "runtimeSpec")]
    runtime_spec: RuntimeSpec,
}

#[derive(Debug, Default, Deserialize)]
struct SandboxConfig {
    #[serde(default)]
    annotations: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimeSpec {
    #[serde(default)]
    linux: LinuxSpec,
}

#[derive(Debug, Default, Deserialize)]
struct LinuxSpec {
    #[serde(default)]
    namespaces: Vec<NamespaceSpec>,
}

#[derive(Debug, Deserialize)]
struct NamespaceSpec {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    path: String,
}

/// Builds the pod config from a verbose CRI sandbox status. `info` is the
/// JSON stored under the `info` key of the status.
pub(crate) fn pod_config_from_sandbox(
    host_network: bool,
    info: Option<&str>,
) -> Result<PodConfig, Report<RuntimeError>> {
    let invalid = |message: &str| RuntimeError::InvalidSandbox {
        message: message.to_string(),
    };
    let info = info.ok_or_else(|| Report::new(invalid("sandbox info not found")))?;
    let info: SandboxInfo =
        serde_json::from_str(info).change_context_lazy(|| invalid("failed to parse sandbox info"))?;

    if host_network {
        return Ok(PodConfig {
            netns: HOST_NETNS.to_string(),
            smcr: false,
        });
    }

    let netns = info
        .runtime_spec
        .linux
        .namespaces
        .iter()
        .find(|ns| ns.kind == "network")
        .map(|ns| ns.path.as_str())
        .filter(|path| !path.is_empty())
        .ok_or_else(|| Report::new(invalid("failed to find network namespace")))?;

    let smcr = match info.config.annotations.get(POD_ANNOTATION_SMCR) {
        None => false,
        Some(value) if value.is_empty() => false,
        Some(value) => parse_bool(value).ok_or_else(|| {
            Report::new(invalid("bad smc-r annotation"))
                .attach_printable(format!("{POD_ANNOTATION_SMCR}={value}"))
        })?,
    };
    Ok(PodConfig {
        netns: netns.to_string(),
        smcr,
    })
}
