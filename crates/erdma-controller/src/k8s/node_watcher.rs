use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::keyed_lock::KeyedAsyncLock;

use crate::cloud::CloudInventory;
use crate::eri::EriResolver;
use crate::k8s::device_object::build_device_object;
use crate::k8s::device_object::create_and_wait;
use crate::k8s::device_object::find_by_instance;
use crate::k8s::device_object::remove_erdma_devices;
use crate::k8s::node::own_node;
use crate::k8s::node::predict_node_update;
use crate::k8s::node::NodeSelector;
use crate::k8s::KubernetesError;

const WATCH_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Creates an `ERdmaDevice` for every owned node that has none and removes
/// the objects of nodes that are gone.
pub struct NodeWatcher<C> {
    client: Client,
    resolver: Arc<EriResolver<C>>,
    selector: NodeSelector,
    locks: KeyedAsyncLock<String>,
    retry_after: Duration,
}

/// Whether a node event is worth a reconcile. Deletions always are.
pub(crate) fn node_event_triggers(selector: &NodeSelector, old: Option<&Node>, new: &Node) -> bool {
    match old {
        None => own_node(selector, Some(new)),
        Some(_) => predict_node_update(selector, old, new),
    }
}

impl<C: CloudInventory> NodeWatcher<C> {
    pub fn new(
        client: Client,
        resolver: Arc<EriResolver<C>>,
        selector: NodeSelector,
        retry_after: Duration,
    ) -> Self {
        Self {
            client,
            resolver,
            selector,
            locks: KeyedAsyncLock::new(),
            retry_after,
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), Report<KubernetesError>> {
        info!(selector = ?self.selector, "Starting node watcher");
        loop {
            select! {
                _ = token.cancelled() => {
                    info!("Node watcher shutdown requested");
                    break;
                }
                result = self.watch_nodes(&token) => {
                    match result {
                        Ok(()) => warn!("Node watch stream ended unexpectedly, restarting..."),
                        Err(e) => {
                            error!("Node watch failed: {e:?}");
                            tokio::time::sleep(WATCH_RESTART_DELAY).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn watch_nodes(self: &Arc<Self>, token: &CancellationToken) -> Result<(), Report<KubernetesError>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let mut stream = watcher(api, Config::default()).boxed();
        let mut known: HashMap<String, Node> = HashMap::new();

        while let Some(event) =
            stream
                .try_next()
                .await
                .change_context(KubernetesError::WatchFailed {
                    resource: "nodes".to_string(),
                    message: "watch stream error".to_string(),
                })?
        {
            match event {
                Event::Applied(node) => {
                    let name = node.name_any();
                    let old = known.insert(name.clone(), node.clone());
                    if node_event_triggers(&self.selector, old.as_ref(), &node) {
                        self.dispatch(name, token.clone());
                    }
                }
                Event::Deleted(node) => {
                    let name = node.name_any();
                    known.remove(&name);
                    self.dispatch(name, token.clone());
                }
                Event::Restarted(nodes) => {
                    let mut fresh = HashMap::with_capacity(nodes.len());
                    for node in nodes {
                        let name = node.name_any();
                        if node_event_triggers(&self.selector, None, &node) {
                            self.dispatch(name.clone(), token.clone());
                        }
                        known.remove(&name);
                        fresh.insert(name, node);
                    }
                    // whatever is left disappeared while the watch was down
                    for name in known.into_keys() {
                        self.dispatch(name, token.clone());
                    }
                    known = fresh;
                }
            }
        }
        Ok(())
    }

    /// Reconciles `name` in the background until it succeeds. Work for the
    /// same node never overlaps.
    fn dispatch(self: &Arc<Self>, name: String, token: CancellationToken) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = this.locks.lock(&name).await;
            loop {
                match this.reconcile(&name).await {
                    Ok(()) => break,
                    Err(e) => error!(node = %name, "Failed to reconcile node: {e:?}"),
                }
                select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(this.retry_after) => {}
                }
            }
        });
    }

    #[tracing::instrument(skip(self))]
    async fn reconcile(&self, name: &str) -> Result<(), Report<KubernetesError>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes
            .get_opt(name)
            .await
            .change_context(KubernetesError::ApiCall {
                message: format!("get node {name}"),
            })?;
        let node = match node {
            Some(node) if node.metadata.deletion_timestamp.is_none() => node,
            _ => return remove_erdma_devices(&self.client, name).await,
        };
        if !own_node(&self.selector, Some(&node)) {
            debug!("node not selected");
            return Ok(());
        }

        let resolve_error = || KubernetesError::Resolve {
            node: name.to_string(),
        };
        let instance_id = self
            .resolver
            .instance_id_from_node(&node)
            .await
            .change_context_lazy(resolve_error)?;
        if !find_by_instance(&self.client, &instance_id).await?.is_empty() {
            return Ok(());
        }

        let Some(eris) = self
            .resolver
            .select_eris(&instance_id)
            .await
            .change_context_lazy(resolve_error)?
        else {
            info!(instance_id = %instance_id, "node not support erdma");
            return Ok(());
        };
        let device = build_device_object(&node, &instance_id, &eris);
        create_and_wait(&self.client, &device).await
    }
}
