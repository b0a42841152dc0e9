use api_types::DeviceInfo;

use crate::cloud::NetworkInterface;
use crate::cloud::ENI_STATUS_AVAILABLE;
use crate::cloud::ENI_STATUS_IN_USE;

/// What one reconcile pass does for a device entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAction {
    Ready,
    /// Attach a detached secondary interface.
    Attach { card_index: i32 },
    /// Switch the primary interface to RDMA mode.
    Convert { queue_pair: i32 },
    Fail(String),
    /// Nothing to report this pass.
    Skip,
}

pub fn plan_device(device: &DeviceInfo, eni: Option<&NetworkInterface>) -> DeviceAction {
    let Some(eni) = eni else {
        return DeviceAction::Fail(format!("cannot find eni {}", device.id));
    };
    let Some(status) = eni.status.as_deref() else {
        return DeviceAction::Fail(format!("cannot find eni {} status", device.id));
    };

    if status == ENI_STATUS_IN_USE && eni.is_rdma() {
        DeviceAction::Ready
    } else if !device.is_primary_eni && status == ENI_STATUS_AVAILABLE {
        DeviceAction::Attach {
            card_index: device.network_card_index,
        }
    } else if device.is_primary_eni && status == ENI_STATUS_IN_USE {
        DeviceAction::Convert {
            queue_pair: device.queue_pair,
        }
    } else {
        DeviceAction::Skip
    }
}
