//! Kernel driver handling for eRDMA devices on the node.
//!
//! A driver kind is picked once at agent start from an explicit
//! [`DriverRegistry`]. [`ERdmaDriver`] then loads the kernel module and
//! turns each ERI into an [`ERdmaDeviceInfo`].

use core::error::Error;
use std::sync::Arc;

use api_types::Capabilities;
use api_types::ERdmaDeviceInfo;
use api_types::Eri;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;

pub mod discovery;
pub mod exec;
pub mod netdev;
pub mod probe;
pub mod smc;

use exec::Shell;
use netdev::NetConf;
use netdev::NetDeviceConfigurator;
use probe::HostPaths;

use crate::metadata::MetadataClient;

#[derive(Debug, derive_more::Display)]
pub enum DriverError {
    #[display("Command failed: {command}")]
    Exec { command: String },
    #[display("Failed to access {path}")]
    Io { path: String },
    #[display("Probe failed: {message}")]
    Probe { message: String },
    #[display("Cannot find {what}")]
    NotFound { what: String },
    #[display("No erdma driver named {name:?} found")]
    UnknownDriver { name: String },
    #[display("eRDMA is not supported on {os}")]
    Unsupported { os: String },
    #[display("Invalid exposed ERI entry {entry:?}, expected \"<instance-id> <dev>[/<dev>...]\"")]
    InvalidExpose { entry: String },
    #[display("Failed to install the erdma driver")]
    Install,
}

impl Error for DriverError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DriverKind {
    /// Upstream verbs with SMC-R.
    #[display("default")]
    Default,
    /// OFED compatible mode for GPU hosts.
    #[display("ofed")]
    Ofed,
    #[display("compat")]
    Compat,
    #[display("fake")]
    Fake,
    #[display("unsupported")]
    Unsupported,
}

impl DriverKind {
    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::Default => Capabilities::VERBS | Capabilities::RDMA_CM | Capabilities::SMC_R,
            Self::Ofed => Capabilities::VERBS | Capabilities::OOB,
            Self::Compat => Capabilities::VERBS | Capabilities::OOB | Capabilities::SMC_R,
            Self::Fake => {
                Capabilities::GDR
                    | Capabilities::SMC_R
                    | Capabilities::VERBS
                    | Capabilities::RDMA_CM
                    | Capabilities::OOB
            }
            Self::Unsupported => Capabilities::empty(),
        }
    }

    /// Value of the erdma `compat_mode` module parameter.
    fn compat_mode(self) -> Option<bool> {
        match self {
            Self::Default => Some(false),
            Self::Ofed | Self::Compat => Some(true),
            Self::Fake | Self::Unsupported => None,
        }
    }

    fn installer_flags(self) -> &'static str {
        match self {
            Self::Ofed => "--egs",
            Self::Compat => "--compat",
            _ => "",
        }
    }

    fn needs_smc(self) -> bool {
        matches!(self, Self::Default | Self::Compat)
    }
}

/// Driver kinds available on this platform, in fallback order.
#[derive(Debug, Clone)]
pub struct DriverRegistry {
    kinds: Vec<DriverKind>,
}

impl DriverRegistry {
    pub fn new(kinds: Vec<DriverKind>) -> Self {
        Self { kinds }
    }

    pub fn for_platform() -> Self {
        if cfg!(target_os = "linux") {
            Self::new(vec![
                DriverKind::Default,
                DriverKind::Ofed,
                DriverKind::Compat,
                DriverKind::Fake,
            ])
        } else {
            Self::new(vec![DriverKind::Unsupported, DriverKind::Fake])
        }
    }

    pub fn get(&self, name: &str) -> Option<DriverKind> {
        self.kinds.iter().copied().find(|k| k.to_string() == name)
    }

    /// The preferred driver, or `ofed` when the host has the GPU tool and
    /// `default` otherwise.
    pub async fn select<S: Shell + ?Sized>(
        &self,
        preferred: &str,
        shell: &S,
    ) -> Result<DriverKind, Report<DriverError>> {
        if !preferred.is_empty() {
            return self.get(preferred).ok_or_else(|| {
                Report::new(DriverError::UnknownDriver {
                    name: preferred.to_string(),
                })
            });
        }
        let wanted = if shell.host("which nvidia-smi").await.is_ok() {
            DriverKind::Ofed
        } else {
            DriverKind::Default
        };
        self.kinds
            .iter()
            .copied()
            .find(|k| *k == wanted)
            .or_else(|| self.kinds.first().copied())
            .ok_or_else(|| {
                Report::new(DriverError::UnknownDriver {
                    name: wanted.to_string(),
                })
            })
    }
}

const INSTALLER_URL: &str = "http://mirrors.cloud.aliyuncs.com/erdma/env_setup.sh";

fn load_module_script(compat_mode: bool) -> String {
    let (want, other) = if compat_mode { ("Y", "N") } else { ("N", "Y") };
    format!(
        "if [ -f /sys/module/erdma/parameters/compat_mode ] && [ \"{other}\" == $(cat /sys/module/erdma/parameters/compat_mode) ]; \
         then rmmod erdma && modprobe erdma compat_mode={want}; else modprobe erdma compat_mode={want}; fi"
    )
}

pub struct ERdmaDriver<S> {
    kind: DriverKind,
    shell: Arc<S>,
    host: HostPaths,
    netdev: Arc<dyn NetDeviceConfigurator>,
    metadata: Arc<MetadataClient>,
}

impl<S: Shell> ERdmaDriver<S> {
    pub fn new(
        kind: DriverKind,
        shell: Arc<S>,
        host: HostPaths,
        netdev: Arc<dyn NetDeviceConfigurator>,
        metadata: Arc<MetadataClient>,
    ) -> Self {
        Self {
            kind,
            shell,
            host,
            netdev,
            metadata,
        }
    }

    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    async fn is_container_os(&self) -> bool {
        matches!(self.shell.command("uname", &["-r"]).await, Ok(release) if release.contains("lifsea"))
    }

    async fn driver_exists(&self, container_os: bool) -> bool {
        let found = if container_os {
            self.shell.container("modinfo erdma").await
        } else {
            self.shell.host("stat /bin/eadm && modinfo erdma").await
        };
        if let Err(e) = &found {
            info!("driver not exists: {e:?}");
        }
        found.is_ok()
    }

    /// Makes sure the kernel module is present and loaded in the mode this
    /// driver kind needs.
    #[tracing::instrument(skip(self), fields(driver = %self.kind))]
    pub async fn install(&self) -> Result<(), Report<DriverError>> {
        if matches!(self.kind, DriverKind::Fake | DriverKind::Unsupported) {
            return Ok(());
        }

        let container_os = self.is_container_os().await;
        if !self.driver_exists(container_os).await {
            if container_os {
                self.shell
                    .container("lifseacli pkg install kernel-modules-$(uname -r)")
                    .await
                    .change_context(DriverError::Install)?;
            } else {
                let script = format!(
                    "cd /tmp && rm -f env_setup.sh && wget {INSTALLER_URL} && bash env_setup.sh {}",
                    self.kind.installer_flags()
                );
                self.shell
                    .host(&script)
                    .await
                    .change_context(DriverError::Install)?;
            }
        }

        if let Some(compat_mode) = self.kind.compat_mode() {
            self.shell
                .container(&load_module_script(compat_mode))
                .await
                .change_context(DriverError::Install)?;
        }
        if self.kind.needs_smc() {
            self.shell
                .container("modprobe smc")
                .await
                .change_context(DriverError::Install)?;
        }
        info!("erdma driver ready");
        Ok(())
    }

    /// Finds the kernel device behind `eri`, configuring its net device
    /// first when it is a secondary interface.
    #[tracing::instrument(skip(self), fields(eri = %eri.id))]
    pub async fn probe_device(&self, eri: &Eri) -> Result<ERdmaDeviceInfo, Report<DriverError>> {
        match self.kind {
            DriverKind::Fake => {
                return Ok(ERdmaDeviceInfo {
                    name: "erdma_0".to_string(),
                    mac: eri.mac.clone(),
                    dev_paths: vec!["/dev/infiniband/uverbs0".to_string()],
                    numa: 0,
                    capabilities: self.kind.capabilities(),
                })
            }
            DriverKind::Unsupported => {
                return Err(Report::new(DriverError::Unsupported {
                    os: std::env::consts::OS.to_string(),
                }))
            }
            _ => {}
        }

        let Some(device) = self.host.net_device_by_mac(&eri.mac)? else {
            return Err(Report::new(DriverError::NotFound {
                what: format!("net device with mac {}", eri.mac),
            }));
        };
        if !eri.is_primary_eni {
            let conf = NetConf::from_metadata(&self.metadata, &eri.mac).await?;
            self.netdev.configure(&device, &conf).await?;
        }

        let Some(ibdev) = self.host.rdma_link_for_mac(&eri.mac)? else {
            return Err(Report::new(DriverError::NotFound {
                what: format!("rdma link for {}", device.name),
            }));
        };
        let dev_paths = self.host.dev_paths(&ibdev)?;
        let numa = self.host.numa_node(&ibdev)?;
        Ok(ERdmaDeviceInfo {
            name: ibdev,
            mac: eri.mac.clone(),
            dev_paths,
            numa,
            capabilities: self.kind.capabilities(),
        })
    }
}
