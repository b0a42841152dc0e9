//! Helpers shared by the controller and the node agent.

mod build_info;
pub mod keyed_lock;
pub mod logging;
pub mod version;
