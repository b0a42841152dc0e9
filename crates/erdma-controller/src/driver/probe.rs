//! Device discovery through sysfs.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;

use super::DriverError;

/// A physical network device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetDevice {
    pub name: String,
    pub mac: String,
    pub oper_up: bool,
}

/// Roots of the sysfs and devfs trees, swapped out in tests.
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub sys: PathBuf,
    pub dev: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            sys: PathBuf::from("/sys"),
            dev: PathBuf::from("/dev"),
        }
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

fn sorted_entries(dir: &Path) -> Result<Vec<String>, Report<DriverError>> {
    let entries = fs::read_dir(dir).change_context_lazy(|| DriverError::Io {
        path: dir.display().to_string(),
    })?;
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

/// MAC carried in an eRDMA node GUID (`xxxx:xxxx:xxxx:xxxx`), with the
/// universal/local bit still flipped.
pub fn mac_from_node_guid(guid: &str) -> Option<[u8; 6]> {
    let hex: String = guid.chars().filter(|c| *c != ':').collect();
    if hex.len() != 16 {
        return None;
    }
    let mut bytes = [0u8; 8];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some([bytes[0], bytes[1], bytes[2], bytes[5], bytes[6], bytes[7]])
}

pub fn parse_mac(mac: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut out = [0u8; 6];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16).ok()?;
    }
    Some(out)
}

impl HostPaths {
    fn class(&self, class: &str) -> PathBuf {
        self.sys.join("class").join(class)
    }

    /// Physical network devices, virtual ones have no `device` link.
    pub fn net_devices(&self) -> Result<Vec<NetDevice>, Report<DriverError>> {
        let root = self.class("net");
        let mut devices = Vec::new();
        for name in sorted_entries(&root)? {
            let dir = root.join(&name);
            if !dir.join("device").exists() {
                continue;
            }
            let Some(mac) = read_trimmed(&dir.join("address")) else {
                continue;
            };
            let oper_up = read_trimmed(&dir.join("operstate")).as_deref() == Some("up");
            devices.push(NetDevice { name, mac, oper_up });
        }
        Ok(devices)
    }

    pub fn net_device_by_mac(&self, mac: &str) -> Result<Option<NetDevice>, Report<DriverError>> {
        Ok(self
            .net_devices()?
            .into_iter()
            .find(|d| d.mac.eq_ignore_ascii_case(mac)))
    }

    /// RDMA device whose node GUID was derived from `mac`.
    pub fn rdma_link_for_mac(&self, mac: &str) -> Result<Option<String>, Report<DriverError>> {
        let Some(mut wanted) = parse_mac(mac) else {
            return Err(Report::new(DriverError::Probe {
                message: format!("invalid mac {mac}"),
            }));
        };
        wanted[0] ^= 0x2;

        let root = self.class("infiniband");
        if !root.exists() {
            return Ok(None);
        }
        for name in sorted_entries(&root)? {
            let Some(guid) = read_trimmed(&root.join(&name).join("node_guid")) else {
                continue;
            };
            let candidate = mac_from_node_guid(&guid).ok_or_else(|| {
                Report::new(DriverError::Probe {
                    message: format!("invalid rdma guid {guid} on {name}"),
                })
            })?;
            debug!(rdma_link = %name, guid = %guid, "check rdma link");
            if candidate == wanted {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    /// Character devices a container needs to use `ibdev`.
    pub fn dev_paths(&self, ibdev: &str) -> Result<Vec<String>, Report<DriverError>> {
        let root = self.class("infiniband_verbs");
        let mut paths = Vec::new();
        for uverbs in sorted_entries(&root)? {
            if read_trimmed(&root.join(&uverbs).join("ibdev")).as_deref() == Some(ibdev) {
                paths.push(format!("/dev/infiniband/{uverbs}"));
            }
        }
        if paths.is_empty() {
            return Err(Report::new(DriverError::NotFound {
                what: format!("dev path for {ibdev}"),
            }));
        }
        if self.dev.join("infiniband/rdma_cm").exists() {
            paths.push("/dev/infiniband/rdma_cm".to_string());
        }
        Ok(paths)
    }

    /// NUMA node of `ibdev`, unknown (-1) is reported as 0.
    pub fn numa_node(&self, ibdev: &str) -> Result<i64, Report<DriverError>> {
        let path = self.class("infiniband").join(ibdev).join("device/numa_node");
        let raw = fs::read_to_string(&path).change_context_lazy(|| DriverError::Io {
            path: path.display().to_string(),
        })?;
        let numa: i64 = raw.trim().parse::<i64>().change_context_lazy(|| DriverError::Probe {
            message: format!("failed to parse numa node for {ibdev}: {raw:?}"),
        })?;
        Ok(numa.max(0))
    }
}


#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::fixture::write_device;
    use super::*;

    fn paths(root: &Path) -> HostPaths {
        HostPaths {
            sys: root.join("sys"),
            dev: root.join("dev"),
        }
    }

    #[test]
    fn guid_maps_back_to_flipped_mac() {
        assert_eq!(
            mac_from_node_guid("0216:3eff:fe0a:0b0c"),
            Some([0x02, 0x16, 0x3e, 0x0a, 0x0b, 0x0c])
        );
        assert_eq!(mac_from_node_guid("0216:3eff"), None);
        assert_eq!(mac_from_node_guid("zz16:3eff:fe0a:0b0c"), None);
    }

    #[test]
    fn probes_link_paths_and_numa() {
        let dir = tempfile::tempdir().unwrap();
        write_device(
            dir.path(),
            "eth1",
            "00:16:3e:0a:0b:0c",
            "erdma_0",
            "uverbs0",
            "0216:3eff:fe0a:0b0c",
        );
        let host = paths(dir.path());

        let dev = host.net_device_by_mac("00:16:3E:0A:0B:0C").unwrap().unwrap();
        assert_eq!(dev.name, "eth1");
        assert!(dev.oper_up);

        assert_eq!(
            host.rdma_link_for_mac("00:16:3e:0a:0b:0c").unwrap(),
            Some("erdma_0".to_string())
        );
        assert_eq!(host.rdma_link_for_mac("00:16:3e:0a:0b:0d").unwrap(), None);
        assert_eq!(host.dev_paths("erdma_0").unwrap(), vec!["/dev/infiniband/uverbs0"]);
        assert_eq!(host.numa_node("erdma_0").unwrap(), 0);
    }

    #[test]
    fn rdma_cm_is_appended_when_present() {
        let dir = tempfile::tempdir().unwrap();
        write_device(
            dir.path(),
            "eth1",
            "00:16:3e:0a:0b:0c",
            "erdma_0",
            "uverbs3",
            "0216:3eff:fe0a:0b0c",
        );
        fs::create_dir_all(dir.path().join("dev/infiniband")).unwrap();
        fs::write(dir.path().join("dev/infiniband/rdma_cm"), "").unwrap();

        assert_eq!(
            paths(dir.path()).dev_paths("erdma_0").unwrap(),
            vec!["/dev/infiniband/uverbs3", "/dev/infiniband/rdma_cm"]
        );
        assert!(paths(dir.path()).dev_paths("erdma_1").is_err());
    }

    #[test]
    fn virtual_devices_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let veth = dir.path().join("sys/class/net/veth0");
        fs::create_dir_all(&veth).unwrap();
        fs::write(veth.join("address"), "aa:bb:cc:dd:ee:ff\n").unwrap();

        assert!(paths(dir.path()).net_devices().unwrap().is_empty());
    }
}
