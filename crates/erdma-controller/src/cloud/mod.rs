//! Cloud compute and network inventory.
//!
//! [`CloudInventory`] is the seam between the resolver and the ECS OpenAPI.
//! [`EcsClient`] is the production implementation; tests use an in-memory
//! fake.

use core::error::Error;

use async_trait::async_trait;
use error_stack::Report;
use serde::Deserialize;

pub(crate) mod ecs;
mod signer;

pub use ecs::EcsClient;
pub use ecs::EndpointNetwork;

pub const TRAFFIC_MODE_RDMA: &str = "HighPerformance";
pub const ENI_TYPE_PRIMARY: &str = "Primary";
pub const ENI_STATUS_IN_USE: &str = "InUse";
pub const ENI_STATUS_AVAILABLE: &str = "Available";

/// Tag carried by every interface this controller creates.
pub const TAG_CREATOR_KEY: &str = "creator";
pub const TAG_CREATOR_VALUE: &str = "alibabacloud-erdma-controller";
/// Tag binding a created interface to its instance.
pub const TAG_INSTANCE_KEY: &str = "instance-id";

#[derive(Debug, derive_more::Display)]
pub enum CloudError {
    #[display("Failed to send request for {action}: {message}")]
    Transport { action: String, message: String },
    #[display("{action} returned {code}: {message} (request id {request_id})")]
    Api {
        action: String,
        code: String,
        message: String,
        request_id: String,
    },
    #[display("Failed to decode {action} response: {message}")]
    Decode { action: String, message: String },
    #[display("Invalid cloud client configuration: {message}")]
    Configuration { message: String },
}

impl Error for CloudError {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Instance {
    pub instance_id: String,
    pub instance_type: String,
    pub vswitch_id: String,
    pub security_group_ids: Vec<String>,
}

/// Entitlement fields of an instance type. Every quantity may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceType {
    pub instance_type_id: String,
    pub eri_quantity: Option<i32>,
    pub network_card_quantity: Option<i32>,
    pub queue_pair_number: Option<i32>,
    #[serde(rename = "GPUAmount")]
    pub gpu_amount: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Tag {
    #[serde(rename = "TagKey")]
    pub key: String,
    #[serde(rename = "TagValue")]
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Attachment {
    pub network_card_index: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TagSet {
    #[serde(rename = "Tag", default)]
    pub tag: Vec<Tag>,
}

/// A network interface as reported by DescribeNetworkInterfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkInterface {
    pub network_interface_id: String,
    #[serde(rename = "Type")]
    pub interface_type: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub mac_address: String,
    pub instance_id: Option<String>,
    pub network_interface_traffic_mode: Option<String>,
    pub queue_pair_number: Option<i32>,
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub tags: TagSet,
}

impl NetworkInterface {
    pub fn is_rdma(&self) -> bool {
        self.network_interface_traffic_mode.as_deref() == Some(TRAFFIC_MODE_RDMA)
    }

    pub fn is_primary(&self) -> bool {
        self.interface_type.as_deref() == Some(ENI_TYPE_PRIMARY)
    }

    pub fn status_is(&self, status: &str) -> bool {
        self.status.as_deref() == Some(status)
    }

    /// Card the interface is attached to, 0 when unknown.
    pub fn card_index(&self) -> i32 {
        self.attachment
            .as_ref()
            .and_then(|a| a.network_card_index)
            .unwrap_or(0)
    }

    pub fn queue_pairs(&self) -> i32 {
        self.queue_pair_number.unwrap_or(0)
    }

    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tags
            .tag
            .iter()
            .any(|tag| tag.key == key && tag.value == value)
    }

    pub fn created_by_controller(&self) -> bool {
        self.has_tag(TAG_CREATOR_KEY, TAG_CREATOR_VALUE)
    }
}

/// How to look an instance up.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum InstanceLookup {
    #[display("instance id {_0}")]
    Id(String),
    #[display("private ip {_0}")]
    PrivateIp(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInterfaceFilter {
    pub instance_id: Option<String>,
    pub network_interface_ids: Vec<String>,
    pub tags: Vec<Tag>,
}

impl NetworkInterfaceFilter {
    pub fn by_instance(instance_id: &str) -> Self {
        Self {
            instance_id: Some(instance_id.to_string()),
            ..Default::default()
        }
    }

    pub fn by_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            network_interface_ids: ids.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn by_tags(tags: Vec<Tag>) -> Self {
        Self {
            tags,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateNetworkInterfaceRequest {
    pub name: String,
    pub vswitch_id: String,
    pub security_group_ids: Vec<String>,
    pub traffic_mode: String,
    pub queue_pair_number: i32,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedNetworkInterface {
    pub network_interface_id: String,
    pub mac_address: String,
}

/// Cloud calls the resolver and the status reconciler depend on.
#[async_trait]
pub trait CloudInventory: Send + Sync + 'static {
    async fn describe_instances(
        &self,
        lookup: &InstanceLookup,
    ) -> Result<Vec<Instance>, Report<CloudError>>;

    /// Returns `None` when the type is unknown to the cloud.
    async fn describe_instance_type(
        &self,
        instance_type: &str,
    ) -> Result<Option<InstanceType>, Report<CloudError>>;

    async fn describe_network_interfaces(
        &self,
        filter: &NetworkInterfaceFilter,
    ) -> Result<Vec<NetworkInterface>, Report<CloudError>>;

    async fn create_network_interface(
        &self,
        request: &CreateNetworkInterfaceRequest,
    ) -> Result<CreatedNetworkInterface, Report<CloudError>>;

    /// `card_index` is only sent when it is non-zero.
    async fn attach_network_interface(
        &self,
        network_interface_id: &str,
        instance_id: &str,
        card_index: i32,
    ) -> Result<(), Report<CloudError>>;

    async fn modify_traffic_mode(
        &self,
        network_interface_id: &str,
        traffic_mode: &str,
        queue_pair_number: i32,
    ) -> Result<(), Report<CloudError>>;
}
