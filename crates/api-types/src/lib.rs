//! Shared API type definitions
//!
//! The `ERdmaDevice` custom resource exchanged between the controller and the
//! node agent, plus the node-local device description the agent builds from it.

mod device;
mod eri;

pub use device::DeviceInfo;
pub use device::DeviceState;
pub use device::DeviceStatus;
pub use device::ERdmaDevice;
pub use device::ERdmaDeviceSpec;
pub use device::ERdmaDeviceStatus;
pub use eri::Capabilities;
pub use eri::ERdmaDeviceInfo;
pub use eri::Eri;

/// Extended resource advertised to kubelet.
pub const RESOURCE_NAME: &str = "aliyun/erdma";

/// Finalizer held on every `ERdmaDevice` by the controller.
pub const FINALIZER: &str = "network.alibabacloud.com/erdma-controller";

pub const LABEL_INSTANCE_ID: &str = "alibabacloud.com/instance-id";
pub const LABEL_NODE_NAME: &str = "alibabacloud.com/nodename";

/// Pod annotation asking for SMC-R inside the pod network namespace.
pub const POD_ANNOTATION_SMCR: &str = "network.alibabacloud.com/erdma-smcr";

/// Env var carrying the pnet id of the allocated device into containers.
pub const SMCR_PNET_ENV: &str = "ERDMA_SMCR_PNET_ID";
