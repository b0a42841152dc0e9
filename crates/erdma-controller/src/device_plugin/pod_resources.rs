//! Maps an allocated device id back to the pod holding it through the
//! kubelet pod resources API.

use std::path::Path;
use std::time::Duration;

use api_types::RESOURCE_NAME;
use error_stack::Report;
use error_stack::ResultExt;

use super::uds_channel;
use super::DevicePluginError;

pub mod api {
    tonic::include_proto!("v1");
}

use api::pod_resources_lister_client::PodResourcesListerClient;
use api::ListPodResourcesRequest;
use api::ListPodResourcesResponse;

pub const POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";
const POD_RESOURCES_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{namespace}/{name}")]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

/// The pod whose containers hold `device_id` of our resource.
pub(crate) fn find_pod(resources: &ListPodResourcesResponse, device_id: &str) -> Option<PodRef> {
    resources
        .pod_resources
        .iter()
        .find(|pod| {
            pod.containers
                .iter()
                .flat_map(|c| &c.devices)
                .filter(|d| d.resource_name == RESOURCE_NAME)
                .any(|d| d.device_ids.iter().any(|id| id == device_id))
        })
        .map(|pod| PodRef {
            namespace: pod.namespace.clone(),
            name: pod.name.clone(),
        })
}

async fn list(socket: &Path) -> Result<ListPodResourcesResponse, Report<DevicePluginError>> {
    let error = || DevicePluginError::PodResources {
        socket: socket.display().to_string(),
    };
    let channel = uds_channel(socket).await.change_context_lazy(error)?;
    let response = PodResourcesListerClient::new(channel)
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .list(ListPodResourcesRequest {})
        .await
        .change_context_lazy(error)?;
    Ok(response.into_inner())
}

pub async fn pod_for_device(
    socket: &Path,
    device_id: &str,
) -> Result<Option<PodRef>, Report<DevicePluginError>> {
    let resources = tokio::time::timeout(POD_RESOURCES_TIMEOUT, list(socket))
        .await
        .change_context_lazy(|| DevicePluginError::PodResources {
            socket: socket.display().to_string(),
        })??;
    Ok(find_pod(&resources, device_id))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::api::ContainerDevices;
    use super::api::ContainerResources;
    use super::api::PodResources;
    use super::*;

    fn pod(name: &str, resource: &str, ids: &[&str]) -> PodResources {
        PodResources {
            name: name.to_string(),
            namespace: "default".to_string(),
            containers: vec![ContainerResources {
                name: "main".to_string(),
                devices: vec![ContainerDevices {
                    resource_name: resource.to_string(),
                    device_ids: ids.iter().map(|s| s.to_string()).collect(),
                    topology: None,
                }],
                cpu_ids: vec![],
            }],
        }
    }

    #[test]
    fn device_is_found_only_under_our_resource() {
        let resources = ListPodResourcesResponse {
            pod_resources: vec![
                pod("gpu-pod", "nvidia.com/gpu", &["erdma_0/3"]),
                pod("rdma-pod", RESOURCE_NAME, &["erdma_0/1", "erdma_0/3"]),
            ],
        };
        assert_eq!(
            find_pod(&resources, "erdma_0/3"),
            Some(PodRef {
                namespace: "default".to_string(),
                name: "rdma-pod".to_string(),
            })
        );
        assert_eq!(find_pod(&resources, "erdma_0/9"), None);
    }

    #[test]
    fn pod_ref_displays_as_namespaced_name() {
        let pod = PodRef {
            namespace: "kube-system".to_string(),
            name: "web".to_string(),
        };
        assert_eq!(pod.to_string(), "kube-system/web");
    }
}
