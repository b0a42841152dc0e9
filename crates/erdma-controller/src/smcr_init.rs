//! `smcr-init`: run inside a pod's network namespace to switch its TCP
//! sockets to SMC-R.

use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use tracing::info;

use crate::app::into_anyhow;
use crate::config::SmcrInitArgs;
use crate::driver::exec::SystemShell;
use crate::driver::smc;

const TCP2SMC: &str = "net/smc/tcp2smc";
const DISABLE_IPV6: &str = "net/ipv6/conf/all/disable_ipv6";

/// Writes the SMC-R sysctls below `proc_sys`.
pub(crate) fn configure_sysctls(proc_sys: &Path) -> Result<()> {
    let tcp2smc = proc_sys.join(TCP2SMC);
    // absent until the smc module is loaded
    if !tcp2smc.exists() {
        bail!("error setting tcp2smc: {} not found", tcp2smc.display());
    }
    std::fs::write(&tcp2smc, "1").context("error setting tcp2smc")?;
    std::fs::write(proc_sys.join(DISABLE_IPV6), "1").context("error setting disable_ipv6")?;
    Ok(())
}

pub async fn run(args: SmcrInitArgs) -> Result<()> {
    let Some(pnet_id) = args.pnet_id.filter(|p| !p.is_empty()) else {
        bail!("smcr pnetid is empty");
    };
    configure_sysctls(Path::new("/proc/sys"))?;
    smc::config_for_net_device(&SystemShell, &pnet_id, "eth0")
        .await
        .map_err(into_anyhow)
        .context("error config smcr pnet")?;
    info!(pnet_id = %pnet_id, "smc-r enabled for eth0");
    Ok(())
}
