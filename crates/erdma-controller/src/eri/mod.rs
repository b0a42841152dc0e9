//! ERI resolution: which RDMA interfaces a node should carry and how to get
//! them into the ready state.

use core::error::Error;

mod resolver;
mod selection;
mod status;

pub use resolver::EriResolver;
pub use selection::select_eri_from_exist;
pub use selection::Entitlement;
pub use selection::SelectionPlan;
pub use status::plan_device;
pub use status::DeviceAction;

#[derive(Debug, derive_more::Display)]
pub enum ResolverError {
    #[display("cannot find instance by {lookup}")]
    InstanceNotFound { lookup: String },
    #[display("found multiple instance from node internal ip {ip}")]
    MultipleInstances { ip: String },
    #[display("cannot find instance from node internal ip, node {node} has none")]
    MissingInternalIp { node: String },
    #[display("cannot find node primary ENI or existing ENI")]
    NoAnchor,
    #[display("cannot create ERI for instance due to no available slot")]
    NoAvailableSlot,
    #[display("cloud call {operation} failed")]
    Cloud { operation: String },
}

impl Error for ResolverError {}
