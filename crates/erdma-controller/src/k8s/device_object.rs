//! Lifecycle of the per-node `ERdmaDevice` object.

use std::collections::BTreeMap;
use std::time::Duration;

use api_types::DeviceInfo;
use api_types::ERdmaDevice;
use api_types::ERdmaDeviceSpec;
use api_types::Eri;
use api_types::FINALIZER;
use api_types::LABEL_INSTANCE_ID;
use api_types::LABEL_NODE_NAME;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::ObjectMeta;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use tracing::info;
use tracing::warn;

use crate::k8s::KubernetesError;

const CREATE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const CREATE_POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// The device object for `node`, owned by it and labelled for lookup by
/// instance and by node.
pub fn build_device_object(node: &Node, instance_id: &str, eris: &[Eri]) -> ERdmaDevice {
    let node_name = node.name_any();
    let labels = BTreeMap::from([
        (LABEL_INSTANCE_ID.to_string(), instance_id.to_string()),
        (LABEL_NODE_NAME.to_string(), node_name.clone()),
    ]);
    let owner = OwnerReference {
        api_version: "v1".to_string(),
        kind: "Node".to_string(),
        name: node_name.clone(),
        uid: node.metadata.uid.clone().unwrap_or_default(),
        ..Default::default()
    };
    ERdmaDevice {
        metadata: ObjectMeta {
            name: Some(node_name),
            finalizers: Some(vec![FINALIZER.to_string()]),
            owner_references: Some(vec![owner]),
            labels: Some(labels),
            ..Default::default()
        },
        spec: ERdmaDeviceSpec {
            devices: eris.iter().map(DeviceInfo::from).collect(),
        },
        status: None,
    }
}

fn api_error(message: impl Into<String>) -> KubernetesError {
    KubernetesError::ApiCall {
        message: message.into(),
    }
}

pub async fn find_by_instance(
    client: &Client,
    instance_id: &str,
) -> Result<Vec<ERdmaDevice>, Report<KubernetesError>> {
    let api: Api<ERdmaDevice> = Api::all(client.clone());
    let params = ListParams::default().labels(&format!("{LABEL_INSTANCE_ID}={instance_id}"));
    Ok(api
        .list(&params)
        .await
        .change_context(api_error("list ERdmaDevice by instance"))?
        .items)
}

/// Creates the object and waits briefly until it can be read back.
pub async fn create_and_wait(
    client: &Client,
    device: &ERdmaDevice,
) -> Result<(), Report<KubernetesError>> {
    let api: Api<ERdmaDevice> = Api::all(client.clone());
    let name = device.name_any();
    api.create(&Default::default(), device)
        .await
        .change_context(api_error(format!("create ERdmaDevice {name}")))?;
    info!(name = %name, devices = device.spec.devices.len(), "created ERdmaDevice");

    let visible = tokio::time::timeout(CREATE_POLL_TIMEOUT, async {
        loop {
            tokio::time::sleep(CREATE_POLL_INTERVAL).await;
            if matches!(api.get_opt(&name).await, Ok(Some(_))) {
                return;
            }
        }
    })
    .await;
    if visible.is_err() {
        warn!(name = %name, "ERdmaDevice not visible yet after creation");
    }
    Ok(())
}

/// Polls every `interval` until the device object of `node_name` exists,
/// giving up after `attempts` tries.
pub async fn wait_for_node_device(
    client: &Client,
    node_name: &str,
    attempts: u32,
    interval: Duration,
) -> Result<ERdmaDevice, Report<KubernetesError>> {
    let api: Api<ERdmaDevice> = Api::all(client.clone());
    let params = ListParams::default().labels(&format!("{LABEL_NODE_NAME}={node_name}"));
    for attempt in 1..=attempts {
        match api.list(&params).await {
            Ok(list) => {
                if let Some(device) = list.items.into_iter().next() {
                    return Ok(device);
                }
                info!(attempt, "waiting for erdma devices");
            }
            Err(e) => warn!(attempt, "failed to list erdma devices: {e}"),
        }
        tokio::time::sleep(interval).await;
    }
    Err(Report::new(KubernetesError::Timeout {
        what: format!("ERdmaDevice of node {node_name}"),
    }))
}

/// Drops the finalizers of every device object labelled with `node_name`
/// and deletes them.
pub async fn remove_erdma_devices(
    client: &Client,
    node_name: &str,
) -> Result<(), Report<KubernetesError>> {
    let api: Api<ERdmaDevice> = Api::all(client.clone());
    let params = ListParams::default().labels(&format!("{LABEL_NODE_NAME}={node_name}"));
    let devices = api
        .list(&params)
        .await
        .change_context(api_error("list ERdmaDevice by node"))?
        .items;
    if devices.is_empty() {
        return Ok(());
    }

    let clear = serde_json::json!({ "metadata": { "finalizers": null } });
    for device in &devices {
        let name = device.name_any();
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&clear))
            .await
            .change_context(api_error(format!("clear finalizers of {name}")))?;
    }
    for device in &devices {
        let name = device.name_any();
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!(name = %name, "deleted ERdmaDevice"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => {
                return Err(Report::new(e).change_context(api_error(format!("delete {name}"))))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn device_object_is_owned_and_labelled() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("node-a".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let eris = vec![Eri {
            id: "eni-1".to_string(),
            is_primary_eni: true,
            mac: "00:16:3e:00:00:01".to_string(),
            instance_id: "i-abc".to_string(),
            card_index: 0,
            queue_pair: 8,
        }];

        let device = build_device_object(&node, "i-abc", &eris);
        assert_eq!(device.name_any(), "node-a");
        assert_eq!(device.finalizers(), &[FINALIZER.to_string()]);
        assert_eq!(
            device.labels().get(LABEL_INSTANCE_ID).map(String::as_str),
            Some("i-abc")
        );
        assert_eq!(
            device.labels().get(LABEL_NODE_NAME).map(String::as_str),
            Some("node-a")
        );
        let owner = &device.owner_references()[0];
        assert_eq!(owner.kind, "Node");
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(device.spec.devices.len(), 1);
        assert_eq!(Eri::from(&device.spec.devices[0]), eris[0]);
    }
}
