use std::fmt;
use std::ops::BitOr;
use std::ops::BitOrAssign;

use serde::Deserialize;
use serde::Serialize;

use crate::DeviceInfo;

/// Elastic RDMA interface picked for a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eri {
    pub id: String,
    pub is_primary_eni: bool,
    pub mac: String,
    pub instance_id: String,
    pub card_index: i32,
    pub queue_pair: i32,
}

impl From<&DeviceInfo> for Eri {
    fn from(info: &DeviceInfo) -> Self {
        Self {
            id: info.id.clone(),
            is_primary_eni: info.is_primary_eni,
            mac: info.mac.clone(),
            instance_id: info.instance_id.clone(),
            card_index: info.network_card_index,
            queue_pair: info.queue_pair,
        }
    }
}

impl From<&Eri> for DeviceInfo {
    fn from(eri: &Eri) -> Self {
        Self {
            instance_id: eri.instance_id.clone(),
            mac: eri.mac.clone(),
            is_primary_eni: eri.is_primary_eni,
            id: eri.id.clone(),
            network_card_index: eri.card_index,
            queue_pair: eri.queue_pair,
        }
    }
}

/// Feature bits reported by a kernel RDMA driver.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const RDMA_CM: Self = Self(1);
    pub const SMC_R: Self = Self(1 << 1);
    pub const VERBS: Self = Self(1 << 2);
    pub const GDR: Self = Self(1 << 3);
    pub const OOB: Self = Self(1 << 4);

    const NAMES: [(Self, &'static str); 5] = [
        (Self::RDMA_CM, "RDMA_CM"),
        (Self::SMC_R, "SMC_R"),
        (Self::VERBS, "VERBS"),
        (Self::GDR, "GDR"),
        (Self::OOB, "OOB"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join(","))
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capabilities({self})")
    }
}

/// A probed kernel RDMA device. Rebuilt on every agent start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ERdmaDeviceInfo {
    /// kernel device name, e.g. `erdma_0`
    pub name: String,
    pub mac: String,
    pub dev_paths: Vec<String>,
    pub numa: i64,
    pub capabilities: Capabilities,
}

impl ERdmaDeviceInfo {
    /// Pairing network id, the MAC uppercased with the colons removed.
    pub fn pnet_id(&self) -> String {
        pnet_id_from_mac(&self.mac)
    }
}

pub(crate) fn pnet_id_from_mac(mac: &str) -> String {
    mac.to_uppercase().replace(':', "")
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn device_info_round_trips_through_eri() {
        let info = DeviceInfo {
            instance_id: "i-abc".to_string(),
            mac: "00:16:3e:0a:0b:0c".to_string(),
            is_primary_eni: false,
            id: "eni-2".to_string(),
            network_card_index: 1,
            queue_pair: 6,
        };
        let eri = Eri::from(&info);
        assert_eq!(DeviceInfo::from(&eri), info);
    }

    #[test]
    fn capabilities_display_in_bit_order() {
        let caps = Capabilities::VERBS | Capabilities::RDMA_CM | Capabilities::SMC_R;
        assert_eq!(caps.to_string(), "RDMA_CM,SMC_R,VERBS");
        assert!(caps.contains(Capabilities::SMC_R));
        assert!(!caps.contains(Capabilities::OOB));
        assert!(!caps.contains(Capabilities::empty()));
        assert_eq!(Capabilities::empty().to_string(), "");
    }

    #[test]
    fn pnet_id_strips_colons_and_uppercases() {
        let info = ERdmaDeviceInfo {
            name: "erdma_0".to_string(),
            mac: "00:16:3e:0a:0b:0c".to_string(),
            dev_paths: vec![],
            numa: 0,
            capabilities: Capabilities::VERBS,
        };
        assert_eq!(info.pnet_id(), "00163E0A0B0C");
    }
}
