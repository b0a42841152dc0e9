use std::collections::HashMap;
use std::path::PathBuf;

use api_types::POD_ANNOTATION_SMCR;
use async_trait::async_trait;
use bytes::Bytes;
use error_stack::Report;
use error_stack::ResultExt;
use http_body_util::BodyExt;
use http_body_util::Empty;
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::UnixStream;
use tracing::debug;

use super::parse_bool;
use super::PodConfig;
use super::RuntimeError;
use super::SandboxInspector;
use super::REQUEST_TIMEOUT;
use crate::device_plugin::pod_resources::PodRef;

pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Deserialize)]
struct ContainerSummary {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    #[serde(default)]
    state: Option<ContainerState>,
    #[serde(default)]
    config: Option<ContainerConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    #[serde(default)]
    pid: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

/// Docker Engine API client over the engine's unix socket.
#[derive(Debug, Clone)]
pub struct DockerClient {
    socket: PathBuf,
}

fn sandbox_filters(pod: &PodRef) -> String {
    let name = format!("io.kubernetes.pod.name={}", pod.name);
    let namespace = format!("io.kubernetes.pod.namespace={}", pod.namespace);
    let filters = serde_json::json!({
        "label": {
            "io.kubernetes.docker.type=podsandbox": true,
            name: true,
            namespace: true,
        }
    });
    urlencoding::encode(&filters.to_string()).into_owned()
}

fn invalid(message: impl Into<String>) -> RuntimeError {
    RuntimeError::InvalidSandbox {
        message: message.into(),
    }
}

/// Pod config from an inspected sandbox container. The pod annotations are
/// mirrored into its labels with an `annotation.` prefix.
fn pod_config_from_inspect(inspect: &ContainerInspect) -> Result<PodConfig, Report<RuntimeError>> {
    let pid = inspect.state.as_ref().map(|s| s.pid).unwrap_or_default();
    if pid == 0 {
        return Err(Report::new(invalid("sandbox is not running")));
    }
    let mut config = PodConfig {
        netns: format!("/proc/{pid}/ns/net"),
        smcr: false,
    };
    let label = format!("annotation.{POD_ANNOTATION_SMCR}");
    let Some(value) = inspect
        .config
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .and_then(|labels| labels.get(&label))
    else {
        return Ok(config);
    };
    config.smcr = parse_bool(value)
        .ok_or_else(|| Report::new(invalid(format!("bad smc-r label {label}={value}"))))?;
    Ok(config)
}

impl DockerClient {
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, Report<RuntimeError>> {
        tokio::time::timeout(REQUEST_TIMEOUT, self.request(path))
            .await
            .change_context_lazy(|| RuntimeError::Request {
                what: format!("docker GET {path} timed out"),
            })?
    }

    async fn request<T: DeserializeOwned>(&self, path: &str) -> Result<T, Report<RuntimeError>> {
        let what = || RuntimeError::Request {
            what: format!("docker GET {path}"),
        };
        let stream = UnixStream::connect(&self.socket)
            .await
            .change_context_lazy(what)?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .change_context_lazy(what)?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("docker connection closed: {e}");
            }
        });

        let request = Request::get(path)
            .header("host", "docker")
            .body(Empty::<Bytes>::new())
            .change_context_lazy(what)?;
        let response = sender.send_request(request).await.change_context_lazy(what)?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .change_context_lazy(what)?
            .to_bytes();
        if !status.is_success() {
            return Err(Report::new(what())
                .attach_printable(format!("status: {status}"))
                .attach_printable(String::from_utf8_lossy(&body).into_owned()));
        }
        serde_json::from_slice(&body).change_context_lazy(what)
    }
}

#[async_trait]
impl SandboxInspector for DockerClient {
    async fn pod_config(&self, pod: &PodRef) -> Result<PodConfig, Report<RuntimeError>> {
        let sandboxes: Vec<ContainerSummary> = self
            .get_json(&format!("/containers/json?filters={}", sandbox_filters(pod)))
            .await?;
        let Some(sandbox) = sandboxes.first() else {
            return Err(Report::new(RuntimeError::SandboxNotFound {
                pod: pod.to_string(),
            }));
        };
        let inspect: ContainerInspect = self
            .get_json(&format!("/containers/{}/json", sandbox.id))
            .await?;
        pod_config_from_inspect(&inspect).attach_printable_lazy(|| format!("pod: {pod}"))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn inspect(json: &str) -> ContainerInspect {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn netns_comes_from_the_sandbox_pid() {
        let config = pod_config_from_inspect(&inspect(
            r#"{"State": {"Pid": 4242}, "Config": {"Labels": {
                "annotation.network.alibabacloud.com/erdma-smcr": "true"
            }}}"#,
        ))
        .unwrap();
        assert_eq!(
            config,
            PodConfig {
                netns: "/proc/4242/ns/net".to_string(),
                smcr: true,
            }
        );
    }

    #[test]
    fn stopped_sandbox_is_rejected() {
        assert!(pod_config_from_inspect(&inspect(r#"{"State": {"Pid": 0}}"#)).is_err());
        assert!(pod_config_from_inspect(&inspect("{}")).is_err());
    }

    #[test]
    fn label_absent_means_no_smcr() {
        let config =
            pod_config_from_inspect(&inspect(r#"{"State": {"Pid": 7}, "Config": {"Labels": null}}"#))
                .unwrap();
        assert!(!config.smcr);
    }

    #[test]
    fn filters_select_the_pod_sandbox() {
        let pod = PodRef {
            namespace: "default".to_string(),
            name: "web-0".to_string(),
        };
        let decoded = urlencoding::decode(&sandbox_filters(&pod)).unwrap().into_owned();
        let filters: serde_json::Value = serde_json::from_str(&decoded).unwrap();
        assert_eq!(filters["label"]["io.kubernetes.pod.name=web-0"].as_bool(), Some(true));
        assert_eq!(filters["label"]["io.kubernetes.pod.namespace=default"].as_bool(), Some(true));
        assert_eq!(filters["label"]["io.kubernetes.docker.type=podsandbox"].as_bool(), Some(true));
    }
}
