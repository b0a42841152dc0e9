//! Drives each `ERdmaDevice` until every interface it lists is attached and
//! in RDMA mode.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use api_types::DeviceStatus;
use api_types::ERdmaDevice;
use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::runtime::controller::Action;
use kube::runtime::watcher;
use kube::runtime::Controller;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cloud::CloudInventory;
use crate::eri::EriResolver;
use crate::k8s::device_object::remove_erdma_devices;
use crate::k8s::KubernetesError;

pub struct Context<C> {
    pub client: Client,
    pub resolver: Arc<EriResolver<C>>,
    pub requeue_after: Duration,
}

/// Carries a report through the controller runtime, which wants a std error.
#[derive(Debug)]
pub struct ReconcileError(Report<KubernetesError>);

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl std::error::Error for ReconcileError {}

impl From<Report<KubernetesError>> for ReconcileError {
    fn from(report: Report<KubernetesError>) -> Self {
        Self(report)
    }
}

/// Runs the device controller until `token` is cancelled.
pub async fn run<C: CloudInventory>(ctx: Arc<Context<C>>, token: CancellationToken) {
    let api: Api<ERdmaDevice> = Api::all(ctx.client.clone());
    info!("Starting ERdmaDevice reconciler");
    Controller::new(api, watcher::Config::default())
        .graceful_shutdown_on(async move { token.cancelled().await })
        .run(reconcile::<C>, error_policy::<C>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(name = %object.name, "reconciled"),
                Err(e) => warn!("reconcile failed: {e}"),
            }
        })
        .await;
    info!("ERdmaDevice reconciler stopped");
}

/// Whether the next pass should come back later on its own.
pub(crate) fn needs_requeue(expected: usize, statuses: &[DeviceStatus]) -> bool {
    statuses.len() != expected || !statuses.iter().all(DeviceStatus::is_ready)
}

async fn reconcile<C: CloudInventory>(
    device: Arc<ERdmaDevice>,
    ctx: Arc<Context<C>>,
) -> Result<Action, ReconcileError> {
    let name = device.name_any();
    if device.metadata.deletion_timestamp.is_some() {
        remove_erdma_devices(&ctx.client, &name).await?;
        return Ok(Action::await_change());
    }
    if device.all_ready() {
        return Ok(Action::await_change());
    }

    let statuses = ctx
        .resolver
        .ensure_eri_for_instance(&device.spec.devices)
        .await
        .change_context_lazy(|| KubernetesError::Resolve { node: name.clone() })?;

    let api: Api<ERdmaDevice> = Api::all(ctx.client.clone());
    let patch = serde_json::json!({ "status": { "devices": &statuses } });
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .change_context_lazy(|| KubernetesError::ApiCall {
            message: format!("update status of ERdmaDevice {name}"),
        })?;

    if needs_requeue(device.spec.devices.len(), &statuses) {
        debug!(name = %name, "devices not ready yet");
        return Ok(Action::requeue(ctx.requeue_after));
    }
    info!(name = %name, "all devices ready");
    Ok(Action::await_change())
}

fn error_policy<C: CloudInventory>(
    device: Arc<ERdmaDevice>,
    error: &ReconcileError,
    ctx: Arc<Context<C>>,
) -> Action {
    warn!(name = %device.name_any(), "reconcile error: {error}");
    Action::requeue(ctx.requeue_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_until_every_entry_is_ready() {
        let ready = vec![DeviceStatus::ready("eni-1"), DeviceStatus::ready("eni-2")];
        assert!(!needs_requeue(2, &ready));

        let pending = vec![DeviceStatus::ready("eni-1"), DeviceStatus::pending("eni-2")];
        assert!(needs_requeue(2, &pending));

        let failed = vec![DeviceStatus::failed("eni-1", "quota")];
        assert!(needs_requeue(1, &failed));

        // an entry skipped this pass
        assert!(needs_requeue(2, &ready[..1]));
    }
}
