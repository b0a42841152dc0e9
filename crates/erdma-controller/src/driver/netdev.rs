//! Addressing and routing for secondary ERI net devices, through iproute2.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::exec::Shell;
use super::probe::NetDevice;
use super::DriverError;
use crate::metadata::MetadataClient;

const DEFAULT_METRIC: u32 = 200;

/// Address and routes a secondary interface should carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetConf {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    /// vSwitch CIDR in `a.b.c.d/len` form, the direct route destination.
    pub cidr: String,
    pub gateway: Ipv4Addr,
}

fn invalid(message: String) -> Report<DriverError> {
    Report::new(DriverError::Probe { message })
}

impl NetConf {
    pub fn parse(ip: &str, cidr: &str, gateway: &str) -> Result<Self, Report<DriverError>> {
        let address: Ipv4Addr = ip
            .parse()
            .map_err(|_| invalid(format!("invalid ip address: {ip}")))?;
        let (network, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| invalid(format!("invalid cidr: {cidr}")))?;
        let network: Ipv4Addr = network
            .parse()
            .map_err(|_| invalid(format!("invalid cidr: {cidr}")))?;
        let prefix_len: u8 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| invalid(format!("invalid cidr: {cidr}")))?;
        let gateway: Ipv4Addr = gateway
            .parse()
            .map_err(|_| invalid(format!("invalid gateway address: {gateway}")))?;

        let mask = u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0);
        let network = Ipv4Addr::from(u32::from(network) & mask);
        Ok(Self {
            address,
            prefix_len,
            cidr: format!("{network}/{prefix_len}"),
            gateway,
        })
    }

    pub async fn from_metadata(
        metadata: &MetadataClient,
        mac: &str,
    ) -> Result<Self, Report<DriverError>> {
        let fetch_error = || DriverError::Probe {
            message: format!("failed to read network config of {mac} from metadata"),
        };
        let ip = metadata.private_ip(mac).await.change_context_lazy(fetch_error)?;
        let cidr = metadata.vswitch_cidr(mac).await.change_context_lazy(fetch_error)?;
        let gateway = metadata.gateway(mac).await.change_context_lazy(fetch_error)?;
        Self::parse(&ip, &cidr, &gateway)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub(crate) struct RouteEntry {
    pub dst: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub metric: Option<u32>,
}

impl RouteEntry {
    fn is_to(&self, dst: &str) -> bool {
        let is_default = |d: &str| d == "default" || d == "0.0.0.0/0";
        self.dst == dst || (is_default(dst) && is_default(&self.dst))
    }
}

#[derive(Debug, Deserialize)]
struct AddrEntry {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    local: String,
}

/// One more than the highest metric already used towards `dst`, never below
/// 200.
pub(crate) fn select_metric(existing: &[RouteEntry], dst: &str) -> u32 {
    let highest = existing
        .iter()
        .filter(|r| r.is_to(dst))
        .map(|r| r.metric.unwrap_or(0))
        .max()
        .unwrap_or(0);
    (highest + 1).max(DEFAULT_METRIC)
}

fn parse_json<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<Vec<T>, Report<DriverError>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).change_context(DriverError::Probe {
        message: "unexpected iproute2 output".to_string(),
    })
}

#[async_trait]
pub trait NetDeviceConfigurator: Send + Sync + 'static {
    async fn configure(&self, device: &NetDevice, conf: &NetConf) -> Result<(), Report<DriverError>>;
}

pub struct IpRoute2<S> {
    shell: Arc<S>,
}

impl<S: Shell> IpRoute2<S> {
    pub fn new(shell: Arc<S>) -> Self {
        Self { shell }
    }

    async fn ip(&self, args: &[&str]) -> Result<String, Report<DriverError>> {
        self.shell.command("ip", args).await
    }

    async fn addresses(&self, dev: &str) -> Result<Vec<String>, Report<DriverError>> {
        let raw = self.ip(&["-j", "-4", "addr", "show", "dev", dev]).await?;
        Ok(parse_json::<AddrEntry>(&raw)?
            .into_iter()
            .flat_map(|e| e.addr_info)
            .map(|a| a.local)
            .collect())
    }

    async fn routes(&self, dev: Option<&str>) -> Result<Vec<RouteEntry>, Report<DriverError>> {
        let raw = match dev {
            Some(dev) => self.ip(&["-j", "-4", "route", "show", "dev", dev]).await?,
            None => self.ip(&["-j", "-4", "route", "show"]).await?,
        };
        parse_json(&raw)
    }

    async fn ensure_address(&self, dev: &str, conf: &NetConf) -> Result<(), Report<DriverError>> {
        let wanted = conf.address.to_string();
        if self.addresses(dev).await?.contains(&wanted) {
            return Ok(());
        }
        let address = format!("{wanted}/{}", conf.prefix_len);
        self.ip(&["addr", "add", &address, "dev", dev, "noprefixroute"])
            .await?;
        Ok(())
    }

    async fn ensure_route(
        &self,
        dev: &str,
        current: &[RouteEntry],
        dst: &str,
        gateway: Option<Ipv4Addr>,
        metric: u32,
    ) -> Result<(), Report<DriverError>> {
        let metric_arg = metric.to_string();
        if let Some(existing) = current.iter().find(|r| r.is_to(dst)) {
            let old_metric = existing.metric.unwrap_or(0);
            if old_metric == metric {
                return Ok(());
            }
            let old_metric = old_metric.to_string();
            self.ip(&["route", "del", dst, "dev", dev, "metric", &old_metric])
                .await?;
        }
        let gateway = gateway.map(|g| g.to_string());
        let mut args = vec!["route", "add", dst];
        match &gateway {
            Some(gw) => args.extend(["via", gw.as_str()]),
            None => args.extend(["scope", "link"]),
        }
        args.extend(["dev", dev, "metric", metric_arg.as_str()]);
        self.ip(&args).await?;
        Ok(())
    }

    async fn apply(
        &self,
        dev: &str,
        conf: &NetConf,
        cidr_metric: u32,
        default_metric: u32,
    ) -> Result<(), Report<DriverError>> {
        self.ensure_address(dev, conf).await?;
        let current = self.routes(Some(dev)).await?;
        self.ensure_route(dev, &current, &conf.cidr, None, cidr_metric)
            .await?;
        self.ensure_route(dev, &current, "default", Some(conf.gateway), default_metric)
            .await
    }
}

#[async_trait]
impl<S: Shell> NetDeviceConfigurator for IpRoute2<S> {
    async fn configure(&self, device: &NetDevice, conf: &NetConf) -> Result<(), Report<DriverError>> {
        let dev = device.name.as_str();
        if device.oper_up {
            // reconfiguring a live link would disrupt traffic
            if !self.addresses(dev).await?.contains(&conf.address.to_string()) {
                error!(dev, ip = %conf.address, "ip address not found on link");
            }
            return Ok(());
        }

        let all_routes = self.routes(None).await?;
        let cidr_metric = select_metric(&all_routes, &conf.cidr);
        let default_metric = select_metric(&all_routes, "default");

        info!(dev, "link down, bringing it up");
        self.ip(&["link", "set", "dev", dev, "up"]).await?;
        let result = self.apply(dev, conf, cidr_metric, default_metric).await;
        if result.is_err() {
            // leave it down so the next start configures it again
            if let Err(e) = self.ip(&["link", "set", "dev", dev, "down"]).await {
                warn!(dev, "failed to set link down: {e:?}");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::driver::exec::fake::FakeShell;

    fn route(dst: &str, metric: Option<u32>) -> RouteEntry {
        RouteEntry {
            dst: dst.to_string(),
            gateway: None,
            metric,
        }
    }

    fn conf() -> NetConf {
        NetConf::parse("10.0.1.5", "10.0.1.0/24", "10.0.1.253").unwrap()
    }

    fn down_device() -> NetDevice {
        NetDevice {
            name: "eth1".to_string(),
            mac: "00:16:3e:00:00:02".to_string(),
            oper_up: false,
        }
    }

    #[test]
    fn metric_is_at_least_200_and_above_existing() {
        assert_eq!(select_metric(&[], "default"), 200);
        let existing = vec![
            route("default", None),
            route("0.0.0.0/0", Some(250)),
            route("10.0.1.0/24", Some(100)),
        ];
        assert_eq!(select_metric(&existing, "default"), 251);
        assert_eq!(select_metric(&existing, "10.0.1.0/24"), 200);
    }

    #[test]
    fn conf_normalises_the_cidr() {
        let conf = NetConf::parse("10.0.1.5", "10.0.1.7/24", "10.0.1.253").unwrap();
        assert_eq!(conf.cidr, "10.0.1.0/24");
        assert_eq!(conf.prefix_len, 24);
        assert!(NetConf::parse("10.0.1.5", "10.0.1.0/33", "10.0.1.253").is_err());
        assert!(NetConf::parse("nope", "10.0.1.0/24", "10.0.1.253").is_err());
    }

    #[tokio::test]
    async fn down_link_is_brought_up_and_routed() {
        let shell = Arc::new(FakeShell::default());
        shell.respond(
            "ip -j -4 route show",
            r#"[{"dst":"default","gateway":"10.0.0.253","dev":"eth0","metric":100}]"#,
        );
        shell.respond("ip -j -4 route show dev eth1", "[]");
        shell.respond("ip -j -4 addr show dev eth1", r#"[{"addr_info":[]}]"#);

        IpRoute2::new(Arc::clone(&shell))
            .configure(&down_device(), &conf())
            .await
            .unwrap();

        assert_eq!(
            shell.calls(),
            vec![
                "ip -j -4 route show",
                "ip link set dev eth1 up",
                "ip -j -4 addr show dev eth1",
                "ip addr add 10.0.1.5/24 dev eth1 noprefixroute",
                "ip -j -4 route show dev eth1",
                "ip route add 10.0.1.0/24 scope link dev eth1 metric 200",
                "ip route add default via 10.0.1.253 dev eth1 metric 200",
            ]
        );
    }

    #[tokio::test]
    async fn stale_metric_is_replaced() {
        let shell = Arc::new(FakeShell::default());
        shell.respond("ip -j -4 route show", "[]");
        shell.respond(
            "ip -j -4 route show dev eth1",
            r#"[{"dst":"10.0.1.0/24","metric":200},{"dst":"default","gateway":"10.0.1.253","metric":90}]"#,
        );
        shell.respond(
            "ip -j -4 addr show dev eth1",
            r#"[{"addr_info":[{"local":"10.0.1.5"}]}]"#,
        );

        IpRoute2::new(Arc::clone(&shell))
            .configure(&down_device(), &conf())
            .await
            .unwrap();

        let calls = shell.calls();
        assert!(!calls.iter().any(|c| c.starts_with("ip addr add")));
        assert!(!calls.iter().any(|c| c.contains("10.0.1.0/24") && c.starts_with("ip route")));
        assert!(calls.contains(&"ip route del default dev eth1 metric 90".to_string()));
        assert!(calls.contains(&"ip route add default via 10.0.1.253 dev eth1 metric 200".to_string()));
    }

    #[tokio::test]
    async fn failure_sets_the_link_back_down() {
        let shell = Arc::new(FakeShell::default());
        shell.fail("ip addr add");

        let result = IpRoute2::new(Arc::clone(&shell))
            .configure(&down_device(), &conf())
            .await;

        assert!(result.is_err());
        assert_eq!(shell.calls().last().unwrap(), "ip link set dev eth1 down");
    }

    #[tokio::test]
    async fn up_link_is_only_checked() {
        let shell = Arc::new(FakeShell::default());
        let device = NetDevice {
            oper_up: true,
            ..down_device()
        };

        IpRoute2::new(Arc::clone(&shell))
            .configure(&device, &conf())
            .await
            .unwrap();

        assert_eq!(shell.calls(), vec!["ip -j -4 addr show dev eth1"]);
    }
}
