//! Kubelet device plugin advertising eRDMA devices as `aliyun/erdma`.

#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

use core::error::Error;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use api::device_plugin_server::DevicePluginServer;
use api::registration_client::RegistrationClient;
use api::DevicePluginOptions;
use api::RegisterRequest;
use api_types::RESOURCE_NAME;
use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::driver::DriverKind;

pub mod pod_resources;
pub mod runtime;
mod service;

pub use service::PluginState;
use service::DevicePluginService;

pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";
pub const KUBELET_SOCKET: &str = "kubelet.sock";
pub const RDMA_CM_DEVICE: &str = "/dev/infiniband/rdma_cm";
const API_VERSION: &str = "v1beta1";
const SOCKET_SUFFIX: &str = "-erdma.sock";
const SOCKET_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, derive_more::Display)]
pub enum DevicePluginError {
    #[display("Failed to access {path}")]
    Io { path: String },
    #[display("Failed to listen on {socket}")]
    Bind { socket: String },
    #[display("Failed to register with kubelet at {socket}")]
    Register { socket: String },
    #[display("Failed to list pod resources from {socket}")]
    PodResources { socket: String },
    #[display("Cannot find pod for device {device}")]
    PodNotFound { device: String },
    #[display("Failed to inspect pod sandbox")]
    Runtime,
    #[display("Failed to enable smc-r for pod")]
    Smcr,
}

impl Error for DevicePluginError {}

/// Client channel over a unix socket. The URL is a placeholder, the
/// connector ignores it.
pub(crate) async fn uds_channel(socket: &Path) -> Result<Channel, tonic::transport::Error> {
    let socket = socket.to_path_buf();
    Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move { UnixStream::connect(socket).await.map(TokioIo::new) }
        }))
        .await
}

/// Whether the RDMA CM device file should be handed to containers.
pub fn rdma_cm_available(kind: DriverKind, host_root: &Path) -> bool {
    kind == DriverKind::Default && host_root.join(RDMA_CM_DEVICE.trim_start_matches('/')).exists()
}

struct RunningServer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Serves the DevicePlugin API on `<ts>-erdma.sock` and keeps it registered
/// across kubelet restarts.
pub struct ErdmaDevicePlugin {
    plugin_dir: PathBuf,
    socket: PathBuf,
    state: Arc<PluginState>,
    server: Option<RunningServer>,
}

impl ErdmaDevicePlugin {
    pub fn new(state: PluginState) -> Self {
        Self::with_plugin_dir(PathBuf::from(DEVICE_PLUGIN_PATH), state)
    }

    pub fn with_plugin_dir(plugin_dir: PathBuf, state: PluginState) -> Self {
        let socket = plugin_dir.join(format!("{}{SOCKET_SUFFIX}", chrono::Utc::now().timestamp()));
        Self {
            plugin_dir,
            socket,
            state: Arc::new(state),
            server: None,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn options(&self) -> DevicePluginOptions {
        self.state.options
    }

    /// Removes sockets left behind by earlier runs.
    fn cleanup(&self) -> Result<(), Report<DevicePluginError>> {
        let entries = std::fs::read_dir(&self.plugin_dir).change_context_lazy(|| {
            DevicePluginError::Io {
                path: self.plugin_dir.display().to_string(),
            }
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(SOCKET_SUFFIX) {
                continue;
            }
            info!(file = ?name, "removing previous device plugin socket");
            if let Err(e) = std::fs::remove_file(entry.path()) {
                error!("error on clean up previous device plugin listens: {e}");
            }
        }
        Ok(())
    }

    /// Starts a fresh gRPC server on the plugin socket.
    pub fn start(&mut self, parent: &CancellationToken) -> Result<(), Report<DevicePluginError>> {
        if let Some(server) = self.server.take() {
            server.token.cancel();
        }
        self.cleanup()?;

        let listener = UnixListener::bind(&self.socket).change_context_lazy(|| {
            DevicePluginError::Bind {
                socket: self.socket.display().to_string(),
            }
        })?;
        let token = parent.child_token();
        let service = DevicePluginService::new(Arc::clone(&self.state), token.clone());
        let shutdown = token.clone();
        let handle = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    shutdown.cancelled_owned(),
                )
                .await;
            if let Err(e) = result {
                error!("error start device plugin server: {e}");
            }
        });
        info!(socket = %self.socket.display(), "device plugin server started");
        self.server = Some(RunningServer { token, handle });
        Ok(())
    }

    /// Stops the server, if any, and removes its socket.
    pub async fn stop(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };
        server.token.cancel();
        if tokio::time::timeout(SERVER_STOP_TIMEOUT, server.handle).await.is_err() {
            warn!("device plugin server did not stop in time");
        }
        if let Err(e) = self.cleanup() {
            error!("stop current device plugin server with error: {e:?}");
        }
    }

    pub async fn register(&self) -> Result<(), Report<DevicePluginError>> {
        let kubelet = self.plugin_dir.join(KUBELET_SOCKET);
        let error = || DevicePluginError::Register {
            socket: kubelet.display().to_string(),
        };
        let endpoint = self
            .socket
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint,
            resource_name: RESOURCE_NAME.to_string(),
            options: Some(self.options()),
        };

        let channel = tokio::time::timeout(REGISTER_TIMEOUT, uds_channel(&kubelet))
            .await
            .change_context_lazy(error)?
            .change_context_lazy(error)?;
        RegistrationClient::new(channel)
            .register(request)
            .await
            .change_context_lazy(error)?;
        Ok(())
    }

    /// Serves until `token` is cancelled. A failed first registration only
    /// stops the server; the socket watch then brings it back.
    #[tracing::instrument(skip_all, fields(socket = %self.socket.display()))]
    pub async fn serve(mut self, token: CancellationToken) -> Result<(), Report<DevicePluginError>> {
        self.start(&token)?;
        match self.register().await {
            Ok(()) => info!("Registered device plugin with Kubelet"),
            Err(e) => {
                error!("Could not register device plugin: {e:?}");
                self.stop().await;
            }
        }

        let mut ticker = tokio::time::interval(SOCKET_CHECK_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let exists = tokio::fs::try_exists(&self.socket).await.change_context_lazy(|| {
                DevicePluginError::Io {
                    path: self.socket.display().to_string(),
                }
            })?;
            if exists {
                continue;
            }
            info!("device plugin socket removed, restarting");
            self.stop().await;
            self.start(&token)?;
            self.register().await?;
            info!("Re-registered device plugin with Kubelet");
        }

        self.stop().await;
        Ok(())
    }
}
