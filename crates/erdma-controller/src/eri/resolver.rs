use std::collections::HashMap;
use std::sync::Arc;

use api_types::DeviceInfo;
use api_types::DeviceStatus;
use api_types::Eri;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use tracing::info;
use tracing::warn;

use super::plan_device;
use super::select_eri_from_exist;
use super::DeviceAction;
use super::Entitlement;
use super::ResolverError;
use crate::cloud::CloudInventory;
use crate::cloud::CreateNetworkInterfaceRequest;
use crate::cloud::Instance;
use crate::cloud::InstanceLookup;
use crate::cloud::NetworkInterfaceFilter;
use crate::cloud::Tag;
use crate::cloud::ENI_STATUS_AVAILABLE;
use crate::cloud::TAG_CREATOR_KEY;
use crate::cloud::TAG_CREATOR_VALUE;
use crate::cloud::TAG_INSTANCE_KEY;
use crate::cloud::TRAFFIC_MODE_RDMA;
use crate::k8s::node::node_internal_ip;
use crate::k8s::node::provider_instance_id;

/// Works out and drives the ERIs of cluster nodes against the cloud
/// inventory. Cloud failures are returned to the caller, never retried here.
pub struct EriResolver<C> {
    cloud: Arc<C>,
    manage_non_owned: bool,
}

fn cloud_call(operation: &str) -> ResolverError {
    ResolverError::Cloud {
        operation: operation.to_string(),
    }
}

fn controller_tags(instance_id: &str) -> Vec<Tag> {
    vec![
        Tag::new(TAG_CREATOR_KEY, TAG_CREATOR_VALUE),
        Tag::new(TAG_INSTANCE_KEY, instance_id),
    ]
}

impl<C: CloudInventory> EriResolver<C> {
    pub fn new(cloud: Arc<C>, manage_non_owned: bool) -> Self {
        Self {
            cloud,
            manage_non_owned,
        }
    }

    async fn describe_instance(
        &self,
        lookup: InstanceLookup,
    ) -> Result<Vec<Instance>, Report<ResolverError>> {
        self.cloud
            .describe_instances(&lookup)
            .await
            .change_context(cloud_call("DescribeInstances"))
            .attach_printable_lazy(|| lookup.to_string())
    }

    /// Instance id from the node's provider id, falling back to a lookup by
    /// the node's internal IP.
    pub async fn instance_id_from_node(&self, node: &Node) -> Result<String, Report<ResolverError>> {
        if let Some(instance_id) = provider_instance_id(node) {
            let found = self
                .describe_instance(InstanceLookup::Id(instance_id.clone()))
                .await?;
            match found.into_iter().next() {
                Some(instance) => return Ok(instance.instance_id),
                None => info!(
                    provider_id = ?node.spec.as_ref().and_then(|s| s.provider_id.as_deref()),
                    "cannot find instance from provider id"
                ),
            }
        }

        let node_name = node.metadata.name.clone().unwrap_or_default();
        let Some(ip) = node_internal_ip(node) else {
            return Err(Report::new(ResolverError::MissingInternalIp { node: node_name }));
        };
        let found = self
            .describe_instance(InstanceLookup::PrivateIp(ip.clone()))
            .await?;
        match found.len() {
            0 => Err(Report::new(ResolverError::InstanceNotFound {
                lookup: InstanceLookup::PrivateIp(ip).to_string(),
            })),
            1 => Ok(found
                .into_iter()
                .next()
                .map(|i| i.instance_id)
                .unwrap_or_default()),
            _ => Err(Report::new(ResolverError::MultipleInstances { ip })),
        }
    }

    /// The ERIs the instance should carry, creating missing interfaces.
    /// `None` when the instance type has no RDMA entitlement.
    pub async fn select_eris(
        &self,
        instance_id: &str,
    ) -> Result<Option<Vec<Eri>>, Report<ResolverError>> {
        let lookup = InstanceLookup::Id(instance_id.to_string());
        let Some(instance) = self
            .describe_instance(lookup.clone())
            .await?
            .into_iter()
            .next()
        else {
            return Err(Report::new(ResolverError::InstanceNotFound {
                lookup: lookup.to_string(),
            }));
        };

        let instance_type = self
            .cloud
            .describe_instance_type(&instance.instance_type)
            .await
            .change_context(cloud_call("DescribeInstanceTypes"))
            .attach_printable_lazy(|| format!("instance type {}", instance.instance_type))?;
        let Some(entitlement) = instance_type.as_ref().and_then(Entitlement::from_instance_type)
        else {
            return Ok(None);
        };

        let existing = self
            .cloud
            .describe_network_interfaces(&NetworkInterfaceFilter::by_instance(instance_id))
            .await
            .change_context(cloud_call("DescribeNetworkInterfaces"))?;
        let plan = select_eri_from_exist(
            &existing,
            entitlement.queue_pair_budget,
            entitlement.card_count,
            self.manage_non_owned,
        )
        .attach_printable_lazy(|| format!("instance {instance_id}"))?;

        let mut eris = plan.eris;
        let created = self
            .create_eri_for_instance(
                &instance,
                &plan.need_create,
                plan.queue_pair_per_card,
                &eris,
            )
            .await?;
        eris.extend(created);
        Ok(Some(eris))
    }

    /// Fills the given card indices in ascending order, reusing detached
    /// interfaces tagged for this instance before creating new ones. Anything
    /// in `kept` is never handed out again.
    pub async fn create_eri_for_instance(
        &self,
        instance: &Instance,
        need_create: &[i32],
        queue_pair: i32,
        kept: &[Eri],
    ) -> Result<Vec<Eri>, Report<ResolverError>> {
        if need_create.is_empty() {
            return Ok(Vec::new());
        }
        let mut indices: Vec<i32> = need_create.to_vec();
        indices.sort_unstable();
        let mut pending = indices.into_iter();

        let tags = controller_tags(&instance.instance_id);
        let tagged = self
            .cloud
            .describe_network_interfaces(&NetworkInterfaceFilter::by_tags(tags.clone()))
            .await
            .change_context(cloud_call("DescribeNetworkInterfaces"))?;

        let reusable = tagged.iter().filter(|eni| {
            eni.status_is(ENI_STATUS_AVAILABLE)
                && !kept.iter().any(|eri| eri.id == eni.network_interface_id)
        });

        let mut eris = Vec::new();
        for eni in reusable {
            let Some(card_index) = pending.next() else {
                break;
            };
            let mut eri = super::selection::to_eri(eni, queue_pair);
            eri.instance_id = instance.instance_id.clone();
            eri.card_index = card_index;
            info!(eni = %eri.id, card_index, "reusing tagged ERI");
            eris.push(eri);
        }

        for card_index in pending {
            let request = CreateNetworkInterfaceRequest {
                name: format!("eri-{}-{card_index}", instance.instance_id),
                vswitch_id: instance.vswitch_id.clone(),
                security_group_ids: instance.security_group_ids.clone(),
                traffic_mode: TRAFFIC_MODE_RDMA.to_string(),
                queue_pair_number: queue_pair,
                tags: tags.clone(),
            };
            let created = self
                .cloud
                .create_network_interface(&request)
                .await
                .change_context(cloud_call("CreateNetworkInterface"))
                .attach_printable_lazy(|| format!("name {}", request.name))?;
            info!(eni = %created.network_interface_id, card_index, "created ERI");
            eris.push(Eri {
                id: created.network_interface_id,
                is_primary_eni: false,
                mac: created.mac_address,
                instance_id: instance.instance_id.clone(),
                card_index,
                queue_pair,
            });
        }
        Ok(eris)
    }

    /// Moves every device entry one step towards `Ready` and reports what it
    /// observed. Entries that are mid-transition get no status this pass.
    pub async fn ensure_eri_for_instance(
        &self,
        devices: &[DeviceInfo],
    ) -> Result<Vec<DeviceStatus>, Report<ResolverError>> {
        if devices.is_empty() {
            return Ok(Vec::new());
        }
        let interfaces = self
            .cloud
            .describe_network_interfaces(&NetworkInterfaceFilter::by_ids(
                devices.iter().map(|d| d.id.clone()),
            ))
            .await
            .change_context(cloud_call("DescribeNetworkInterfaces"))?;
        let by_id: HashMap<&str, _> = interfaces
            .iter()
            .map(|eni| (eni.network_interface_id.as_str(), eni))
            .collect();

        let mut statuses = Vec::with_capacity(devices.len());
        for device in devices {
            match plan_device(device, by_id.get(device.id.as_str()).copied()) {
                DeviceAction::Ready => statuses.push(DeviceStatus::ready(&device.id)),
                DeviceAction::Attach { card_index } => {
                    let result = self
                        .cloud
                        .attach_network_interface(&device.id, &device.instance_id, card_index)
                        .await;
                    statuses.push(match result {
                        Ok(()) => DeviceStatus::pending(&device.id),
                        Err(e) => {
                            warn!(eni = %device.id, "attach failed: {e:?}");
                            DeviceStatus::failed(&device.id, e.current_context().to_string())
                        }
                    });
                }
                DeviceAction::Convert { queue_pair } => {
                    let result = self
                        .cloud
                        .modify_traffic_mode(&device.id, TRAFFIC_MODE_RDMA, queue_pair)
                        .await;
                    statuses.push(match result {
                        Ok(()) => DeviceStatus::ready(&device.id),
                        Err(e) => {
                            warn!(eni = %device.id, "convert primary ENI failed: {e:?}");
                            DeviceStatus::failed(&device.id, e.current_context().to_string())
                        }
                    });
                }
                DeviceAction::Fail(message) => {
                    warn!(eni = %device.id, "{message}");
                    statuses.push(DeviceStatus::failed(&device.id, message));
                }
                DeviceAction::Skip => {}
            }
        }
        Ok(statuses)
    }
}
