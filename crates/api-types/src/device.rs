use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// Desired RDMA interfaces of one node. Cluster scoped, named after the node.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network.alibabacloud.com",
    version = "v1",
    kind = "ERdmaDevice",
    status = "ERdmaDeviceStatus",
    shortname = "erdma",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ERdmaDeviceSpec {
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ERdmaDeviceStatus {
    #[serde(default)]
    pub devices: Vec<DeviceStatus>,
}

/// One interface in `spec.devices`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceInfo {
    #[serde(rename = "instanceID", default)]
    pub instance_id: String,
    #[serde(default)]
    pub mac: String,
    #[serde(rename = "isPrimaryENI", default)]
    pub is_primary_eni: bool,
    pub id: String,
    #[serde(rename = "networkCardIndex", default)]
    pub network_card_index: i32,
    #[serde(rename = "queuePair", default)]
    pub queue_pair: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DeviceState {
    /// Attach issued, not confirmed yet.
    Pending,
    Ready,
    /// The last attach or convert call failed, retried on the next pass.
    Failed,
}

/// Observed state of one interface in `status.devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceStatus {
    pub id: String,
    pub status: DeviceState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl DeviceStatus {
    pub fn ready(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: DeviceState::Ready,
            message: String::new(),
        }
    }

    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: DeviceState::Pending,
            message: String::new(),
        }
    }

    pub fn failed(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: DeviceState::Failed,
            message: message.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == DeviceState::Ready
    }
}

impl ERdmaDevice {
    /// True once there is a `Ready` status entry for every spec entry.
    pub fn all_ready(&self) -> bool {
        let Some(status) = &self.status else {
            return self.spec.devices.is_empty();
        };
        status.devices.len() == self.spec.devices.len()
            && status.devices.iter().all(DeviceStatus::is_ready)
    }
}

#[cfg(test)]
mod tests {
    use kube::CustomResourceExt;
    use kube::Resource;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn device_info_uses_cluster_field_names() {
        let info = DeviceInfo {
            instance_id: "i-abc".to_string(),
            mac: "00:16:3e:00:00:01".to_string(),
            is_primary_eni: true,
            id: "eni-1".to_string(),
            network_card_index: 1,
            queue_pair: 8,
        };
        let value = serde_json::to_value(&info).expect("should serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "instanceID": "i-abc",
                "mac": "00:16:3e:00:00:01",
                "isPrimaryENI": true,
                "id": "eni-1",
                "networkCardIndex": 1,
                "queuePair": 8,
            })
        );
    }

    #[test]
    fn status_message_is_omitted_when_empty() {
        let value = serde_json::to_value(DeviceStatus::pending("eni-1")).expect("should serialize");
        assert_eq!(value, serde_json::json!({"id": "eni-1", "status": "Pending"}));

        let failed: DeviceStatus =
            serde_json::from_str(r#"{"id":"eni-2","status":"Failed","message":"quota"}"#)
                .expect("should deserialize");
        assert_eq!(failed, DeviceStatus::failed("eni-2", "quota"));
    }

    #[test]
    fn crd_is_cluster_scoped() {
        let crd = ERdmaDevice::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.group, "network.alibabacloud.com");
        assert_eq!(ERdmaDevice::kind(&()), "ERdmaDevice");
        assert_eq!(ERdmaDevice::plural(&()), "erdmadevices");
    }

    #[test]
    fn all_ready_requires_matching_lengths() {
        let mut device = ERdmaDevice::new(
            "node-a",
            ERdmaDeviceSpec {
                devices: vec![
                    DeviceInfo {
                        id: "eni-1".to_string(),
                        ..Default::default()
                    },
                    DeviceInfo {
                        id: "eni-2".to_string(),
                        ..Default::default()
                    },
                ],
            },
        );
        assert!(!device.all_ready());

        device.status = Some(ERdmaDeviceStatus {
            devices: vec![DeviceStatus::ready("eni-1")],
        });
        assert!(!device.all_ready());

        device.status = Some(ERdmaDeviceStatus {
            devices: vec![DeviceStatus::ready("eni-1"), DeviceStatus::pending("eni-2")],
        });
        assert!(!device.all_ready());

        device.status = Some(ERdmaDeviceStatus {
            devices: vec![DeviceStatus::ready("eni-1"), DeviceStatus::ready("eni-2")],
        });
        assert!(device.all_ready());
    }
}
