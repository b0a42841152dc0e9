use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;
use utils::version;

use super::signer;
use super::signer::SigningInput;
use super::CloudError;
use super::CloudInventory;
use super::CreateNetworkInterfaceRequest;
use super::CreatedNetworkInterface;
use super::Instance;
use super::InstanceLookup;
use super::InstanceType;
use super::NetworkInterface;
use super::NetworkInterfaceFilter;
use super::Tag;
use crate::config::Credential;

const API_VERSION: &str = "2014-05-26";
const PAGE_SIZE: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Which ECS endpoint family to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointNetwork {
    Vpc,
    Public,
}

impl EndpointNetwork {
    pub fn host(self, region: &str) -> String {
        match self {
            Self::Vpc => format!("ecs-vpc.{region}.aliyuncs.com"),
            Self::Public => format!("ecs.{region}.aliyuncs.com"),
        }
    }
}

/// ECS OpenAPI client signing every call with a static access key.
#[derive(Debug, Clone)]
pub struct EcsClient {
    http: reqwest::Client,
    host: String,
    region: String,
    credential: Credential,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    request_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesResponse {
    #[serde(default)]
    total_count: i64,
    #[serde(default)]
    instances: InstanceSet,
}

#[derive(Debug, Default, Deserialize)]
struct InstanceSet {
    #[serde(rename = "Instance", default)]
    instance: Vec<InstanceEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceEntry {
    instance_id: String,
    #[serde(default)]
    instance_type: String,
    #[serde(default)]
    vpc_attributes: VpcAttributes,
    #[serde(default)]
    security_group_ids: SecurityGroupIds,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VpcAttributes {
    #[serde(rename = "VSwitchId", default)]
    vswitch_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct SecurityGroupIds {
    #[serde(rename = "SecurityGroupId", default)]
    security_group_id: Vec<String>,
}

impl From<InstanceEntry> for Instance {
    fn from(entry: InstanceEntry) -> Self {
        Self {
            instance_id: entry.instance_id,
            instance_type: entry.instance_type,
            vswitch_id: entry.vpc_attributes.vswitch_id,
            security_group_ids: entry.security_group_ids.security_group_id,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstanceTypesResponse {
    #[serde(default)]
    instance_types: InstanceTypeSet,
}

#[derive(Debug, Default, Deserialize)]
struct InstanceTypeSet {
    #[serde(rename = "InstanceType", default)]
    instance_type: Vec<InstanceType>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeNetworkInterfacesResponse {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    network_interface_sets: NetworkInterfaceSets,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkInterfaceSets {
    #[serde(rename = "NetworkInterfaceSet", default)]
    network_interface_set: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateNetworkInterfaceResponse {
    network_interface_id: String,
    #[serde(default)]
    mac_address: String,
}

#[derive(Debug, Deserialize)]
struct EmptyResponse {}

fn push_tags(params: &mut Vec<(String, String)>, tags: &[Tag]) {
    for (i, tag) in tags.iter().enumerate() {
        params.push((format!("Tag.{}.Key", i + 1), tag.key.clone()));
        params.push((format!("Tag.{}.Value", i + 1), tag.value.clone()));
    }
}

fn json_array(values: &[&str]) -> String {
    serde_json::Value::from(values.to_vec()).to_string()
}

impl EcsClient {
    pub fn new(
        region: &str,
        network: EndpointNetwork,
        credential: Credential,
    ) -> Result<Self, Report<CloudError>> {
        if region.is_empty() {
            return Err(Report::new(CloudError::Configuration {
                message: "region is empty".to_string(),
            }));
        }
        if !credential.is_complete() {
            return Err(Report::new(CloudError::Configuration {
                message: "access key id or secret is missing".to_string(),
            }));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(version::USER_AGENT.as_str())
            .build()
            .change_context(CloudError::Configuration {
                message: "Failed to build HTTP client".to_string(),
            })?;
        Ok(Self {
            http,
            host: network.host(region),
            region: region.to_string(),
            credential,
        })
    }

    fn region_param(&self) -> (String, String) {
        ("RegionId".to_string(), self.region.clone())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        action: &str,
        params: Vec<(String, String)>,
    ) -> Result<T, Report<CloudError>> {
        let date = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let nonce = uuid::Uuid::new_v4().to_string();
        let security_token = self
            .credential
            .security_token
            .as_ref()
            .map(|t| t.expose());
        let signed = signer::sign(&SigningInput {
            method: "POST",
            host: &self.host,
            action,
            version: API_VERSION,
            params: &params,
            access_key_id: self.credential.access_key_id.expose(),
            access_key_secret: self.credential.access_key_secret.expose(),
            security_token,
            date: &date,
            nonce: &nonce,
        })
        .map_err(|e| {
            Report::new(CloudError::Configuration {
                message: format!("Failed to sign request: {e}"),
            })
        })?;

        let url = if signed.query.is_empty() {
            format!("https://{}/", self.host)
        } else {
            format!("https://{}/?{}", self.host, signed.query)
        };
        let mut request = self.http.post(url);
        for (name, value) in &signed.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        debug!(action, "calling ECS");
        let response = request.send().await.change_context(CloudError::Transport {
            action: action.to_string(),
            message: "request failed".to_string(),
        })?;
        let status = response.status();
        let body = response.text().await.change_context(CloudError::Transport {
            action: action.to_string(),
            message: "Failed to read response body".to_string(),
        })?;

        if !status.is_success() {
            let error: ApiErrorBody = serde_json::from_str(&body).unwrap_or_else(|_| ApiErrorBody {
                code: status.as_u16().to_string(),
                message: body.clone(),
                request_id: String::new(),
            });
            return Err(Report::new(CloudError::Api {
                action: action.to_string(),
                code: error.code,
                message: error.message,
                request_id: error.request_id,
            }));
        }

        serde_json::from_str(&body)
            .change_context(CloudError::Decode {
                action: action.to_string(),
                message: "unexpected response shape".to_string(),
            })
            .attach_printable_lazy(|| format!("body: {body}"))
    }
}

#[async_trait]
impl CloudInventory for EcsClient {
    async fn describe_instances(
        &self,
        lookup: &InstanceLookup,
    ) -> Result<Vec<Instance>, Report<CloudError>> {
        let mut params = vec![self.region_param()];
        match lookup {
            InstanceLookup::Id(id) => {
                params.push(("InstanceIds".to_string(), json_array(&[id.as_str()])));
            }
            InstanceLookup::PrivateIp(ip) => {
                params.push(("InstanceNetworkType".to_string(), "vpc".to_string()));
                params.push(("PrivateIpAddresses".to_string(), json_array(&[ip.as_str()])));
            }
        }
        let response: DescribeInstancesResponse = self.call("DescribeInstances", params).await?;
        debug!(
            %lookup,
            total = response.total_count,
            "described instances"
        );
        Ok(response
            .instances
            .instance
            .into_iter()
            .map(Instance::from)
            .collect())
    }

    async fn describe_instance_type(
        &self,
        instance_type: &str,
    ) -> Result<Option<InstanceType>, Report<CloudError>> {
        let params = vec![
            self.region_param(),
            ("InstanceTypes.1".to_string(), instance_type.to_string()),
        ];
        let response: DescribeInstanceTypesResponse =
            self.call("DescribeInstanceTypes", params).await?;
        let types = response.instance_types.instance_type;
        let exact = types
            .iter()
            .position(|t| t.instance_type_id == instance_type);
        Ok(match exact {
            Some(i) => types.into_iter().nth(i),
            None => types.into_iter().next(),
        })
    }

    async fn describe_network_interfaces(
        &self,
        filter: &NetworkInterfaceFilter,
    ) -> Result<Vec<NetworkInterface>, Report<CloudError>> {
        let mut base = vec![
            self.region_param(),
            ("PageSize".to_string(), PAGE_SIZE.to_string()),
        ];
        if let Some(instance_id) = &filter.instance_id {
            base.push(("InstanceId".to_string(), instance_id.clone()));
        }
        for (i, id) in filter.network_interface_ids.iter().enumerate() {
            base.push((format!("NetworkInterfaceId.{}", i + 1), id.clone()));
        }
        push_tags(&mut base, &filter.tags);

        let mut interfaces = Vec::new();
        let mut page = 1;
        loop {
            let mut params = base.clone();
            params.push(("PageNumber".to_string(), page.to_string()));
            let response: DescribeNetworkInterfacesResponse =
                self.call("DescribeNetworkInterfaces", params).await?;
            let fetched = response.network_interface_sets.network_interface_set;
            let last_page = fetched.len() < PAGE_SIZE;
            interfaces.extend(fetched);
            if last_page || interfaces.len() >= response.total_count {
                break;
            }
            page += 1;
        }
        Ok(interfaces)
    }

    async fn create_network_interface(
        &self,
        request: &CreateNetworkInterfaceRequest,
    ) -> Result<CreatedNetworkInterface, Report<CloudError>> {
        let mut params = vec![
            self.region_param(),
            ("VSwitchId".to_string(), request.vswitch_id.clone()),
            ("NetworkInterfaceName".to_string(), request.name.clone()),
            (
                "NetworkInterfaceTrafficMode".to_string(),
                request.traffic_mode.clone(),
            ),
            (
                "QueuePairNumber".to_string(),
                request.queue_pair_number.to_string(),
            ),
        ];
        for (i, group) in request.security_group_ids.iter().enumerate() {
            params.push((format!("SecurityGroupIds.{}", i + 1), group.clone()));
        }
        push_tags(&mut params, &request.tags);

        let response: CreateNetworkInterfaceResponse =
            self.call("CreateNetworkInterface", params).await?;
        Ok(CreatedNetworkInterface {
            network_interface_id: response.network_interface_id,
            mac_address: response.mac_address,
        })
    }

    async fn attach_network_interface(
        &self,
        network_interface_id: &str,
        instance_id: &str,
        card_index: i32,
    ) -> Result<(), Report<CloudError>> {
        let mut params = vec![
            self.region_param(),
            (
                "NetworkInterfaceId".to_string(),
                network_interface_id.to_string(),
            ),
            ("InstanceId".to_string(), instance_id.to_string()),
        ];
        if card_index != 0 {
            params.push(("NetworkCardIndex".to_string(), card_index.to_string()));
        }
        let _: EmptyResponse = self.call("AttachNetworkInterface", params).await?;
        Ok(())
    }

    async fn modify_traffic_mode(
        &self,
        network_interface_id: &str,
        traffic_mode: &str,
        queue_pair_number: i32,
    ) -> Result<(), Report<CloudError>> {
        let params = vec![
            self.region_param(),
            (
                "NetworkInterfaceId".to_string(),
                network_interface_id.to_string(),
            ),
            (
                "NetworkInterfaceTrafficConfig.NetworkInterfaceTrafficMode".to_string(),
                traffic_mode.to_string(),
            ),
            (
                "NetworkInterfaceTrafficConfig.QueuePairNumber".to_string(),
                queue_pair_number.to_string(),
            ),
        ];
        let _: EmptyResponse = self.call("ModifyNetworkInterfaceAttribute", params).await?;
        Ok(())
    }
}
