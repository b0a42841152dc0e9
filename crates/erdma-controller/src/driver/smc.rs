//! SMC-R pairing network (pnet) table management through `smc_pnet`.

use api_types::ERdmaDeviceInfo;
use error_stack::Report;
use tracing::info;

use super::exec::Shell;
use super::DriverError;

const SMC_PNET: &str = "smc_pnet";

/// Binds the RDMA device to its pnet id unless already present.
pub async fn config_smc_pnet_for_device<S: Shell + ?Sized>(
    shell: &S,
    info: &ERdmaDeviceInfo,
) -> Result<(), Report<DriverError>> {
    let pnet = info.pnet_id();
    let table = shell.command(SMC_PNET, &["-s"]).await?;
    if table.contains(&pnet) {
        return Ok(());
    }
    shell
        .command(SMC_PNET, &["-a", &pnet, "-D", &info.name])
        .await?;
    info!(device = %info.name, pnet = %pnet, "bound rdma device to pnet");
    Ok(())
}

/// Binds `net_device` in the current network namespace to `pnet`.
pub async fn config_for_net_device<S: Shell + ?Sized>(
    shell: &S,
    pnet: &str,
    net_device: &str,
) -> Result<(), Report<DriverError>> {
    let table = shell.command(SMC_PNET, &["-s"]).await?;
    if table.contains(net_device) {
        return Ok(());
    }
    shell
        .command(SMC_PNET, &["-a", pnet, "-I", net_device])
        .await?;
    Ok(())
}

/// `nsenter` argument entering the network namespace at `netns`, a path as
/// seen from the host root.
pub fn netns_arg(netns: &str) -> String {
    format!("-n/proc/1/root/{}", netns.trim_start_matches('/'))
}

/// Same as [`config_for_net_device`] inside the network namespace at
/// `netns`, a path on the host.
pub async fn config_for_netns_net_device<S: Shell + ?Sized>(
    shell: &S,
    pnet: &str,
    net_device: &str,
    netns: &str,
) -> Result<(), Report<DriverError>> {
    let ns_arg = netns_arg(netns);
    let table = shell
        .command("nsenter", &[&ns_arg, "--", SMC_PNET, "-s"])
        .await?;
    if table.contains(net_device) {
        return Ok(());
    }
    shell
        .command("nsenter", &[&ns_arg, "--", SMC_PNET, "-a", pnet, "-I", net_device])
        .await?;
    info!(netns, net_device, pnet, "bound pod net device to pnet");
    Ok(())
}

#[cfg(test)]
mod tests {
    use api_types::Capabilities;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::driver::exec::fake::FakeShell;

    fn device() -> ERdmaDeviceInfo {
        ERdmaDeviceInfo {
            name: "erdma_0".to_string(),
            mac: "00:16:3e:0a:0b:0c".to_string(),
            dev_paths: vec![],
            numa: 0,
            capabilities: Capabilities::SMC_R,
        }
    }

    #[tokio::test]
    async fn device_already_in_table_is_left_alone() {
        let shell = FakeShell::default();
        shell.respond("smc_pnet -s", "00163E0A0B0C erdma_0 1\n");
        config_smc_pnet_for_device(&shell, &device()).await.unwrap();
        assert_eq!(shell.calls(), vec!["smc_pnet -s"]);
    }

    #[tokio::test]
    async fn missing_device_is_added() {
        let shell = FakeShell::default();
        config_smc_pnet_for_device(&shell, &device()).await.unwrap();
        assert_eq!(
            shell.calls(),
            vec!["smc_pnet -s", "smc_pnet -a 00163E0A0B0C -D erdma_0"]
        );
    }

    #[tokio::test]
    async fn netns_binding_runs_inside_the_namespace() {
        let shell = FakeShell::default();
        config_for_netns_net_device(&shell, "00163E0A0B0C", "eth0", "/var/run/netns/cni-1")
            .await
            .unwrap();
        assert_eq!(
            shell.calls(),
            vec![
                "nsenter -n/proc/1/root/var/run/netns/cni-1 -- smc_pnet -s",
                "nsenter -n/proc/1/root/var/run/netns/cni-1 -- smc_pnet -a 00163E0A0B0C -I eth0",
            ]
        );
    }
}
