//! Finds ERIs on the node itself, for clusters without cloud API access.

use std::sync::LazyLock;

use api_types::Eri;
use error_stack::Report;
use regex::Regex;
use tracing::debug;
use tracing::info;

use super::probe::HostPaths;
use super::DriverError;

static EXPOSE_ENTRY: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^i-\w+\s+(\w+(?:/\w+)*)$"));

/// Which RDMA devices of which instances are exposed, parsed from
/// `<instance-id> <dev>[/<dev>...]` entries. No entries exposes everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExposedEris {
    entries: Vec<(String, Vec<String>)>,
}

impl ExposedEris {
    pub fn parse(raw: &[String]) -> Result<Self, Report<DriverError>> {
        let re = EXPOSE_ENTRY.as_ref().map_err(|e| {
            Report::new(DriverError::InvalidExpose {
                entry: e.to_string(),
            })
        })?;
        let mut entries = Vec::new();
        for entry in raw.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
            let Some(captures) = re.captures(entry) else {
                return Err(Report::new(DriverError::InvalidExpose {
                    entry: entry.to_string(),
                }));
            };
            let instance_id = entry.split_whitespace().next().unwrap_or_default();
            let devices = captures
                .get(1)
                .map(|m| m.as_str().split('/').map(str::to_string).collect())
                .unwrap_or_default();
            entries.push((instance_id.to_string(), devices));
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn exposes(&self, instance_id: &str, rdma_device: &str) -> bool {
        self.is_empty()
            || self
                .entries
                .iter()
                .any(|(id, devs)| id == instance_id && devs.iter().any(|d| d == rdma_device))
    }
}

/// Every physical net device backed by an exposed RDMA link. The RDMA
/// device name doubles as the ERI id.
pub fn select_local_eris(
    host: &HostPaths,
    instance_id: &str,
    exposed: &ExposedEris,
) -> Result<Vec<Eri>, Report<DriverError>> {
    let mut eris = Vec::new();
    for device in host.net_devices()? {
        let Some(rdma_device) = host.rdma_link_for_mac(&device.mac)? else {
            debug!(link = %device.name, "link is not an rdma device, skip");
            continue;
        };
        if !exposed.exposes(instance_id, &rdma_device) {
            continue;
        }
        info!(rdma_device = %rdma_device, link = %device.name, "exposing local ERI");
        eris.push(Eri {
            id: rdma_device,
            is_primary_eni: device.name == "eth0",
            mac: device.mac,
            instance_id: instance_id.to_string(),
            card_index: -1,
            queue_pair: -1,
        });
    }
    Ok(eris)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::driver::probe::fixture::write_device;

    fn raw(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn empty_list_exposes_everything() {
        let exposed = ExposedEris::parse(&raw(&[""])).unwrap();
        assert!(exposed.is_empty());
        assert!(exposed.exposes("i-any", "erdma_9"));
    }

    #[test]
    fn entries_expose_listed_devices_of_their_instance() {
        let exposed = ExposedEris::parse(&raw(&["i-abc erdma_0/erdma_1", "i-def erdma_2"])).unwrap();
        assert!(exposed.exposes("i-abc", "erdma_1"));
        assert!(!exposed.exposes("i-abc", "erdma_2"));
        assert!(exposed.exposes("i-def", "erdma_2"));
        assert!(!exposed.exposes("i-xyz", "erdma_0"));
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert!(ExposedEris::parse(&raw(&["abc erdma_0"])).is_err());
        assert!(ExposedEris::parse(&raw(&["i-abc"])).is_err());
        assert!(ExposedEris::parse(&raw(&["i-abc erdma_0//erdma_1"])).is_err());
    }

    #[test]
    fn local_devices_become_eris() {
        let dir = tempfile::tempdir().unwrap();
        write_device(dir.path(), "eth0", "00:16:3e:00:00:01", "erdma_0", "uverbs0", "0216:3eff:fe00:0001");
        write_device(dir.path(), "eth1", "00:16:3e:00:00:02", "erdma_1", "uverbs1", "0216:3eff:fe00:0002");
        let host = HostPaths {
            sys: dir.path().join("sys"),
            dev: dir.path().join("dev"),
        };

        let exposed = ExposedEris::parse(&raw(&["i-abc erdma_1"])).unwrap();
        let eris = select_local_eris(&host, "i-abc", &exposed).unwrap();
        assert_eq!(
            eris,
            vec![Eri {
                id: "erdma_1".to_string(),
                is_primary_eni: false,
                mac: "00:16:3e:00:00:02".to_string(),
                instance_id: "i-abc".to_string(),
                card_index: -1,
                queue_pair: -1,
            }]
        );

        let all = select_local_eris(&host, "i-abc", &ExposedEris::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].is_primary_eni);
    }
}
