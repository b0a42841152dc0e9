use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use clap::Parser;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;

use crate::config::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/erdma-controller/config.json";
pub const DEFAULT_CREDENTIAL_PATH: &str = "/etc/erdma-controller-credential/credential.json";

#[derive(Parser, Clone, Debug)]
pub struct ControllerArgs {
    #[arg(
        long,
        env = "ERDMA_CONTROLLER_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_CONFIG_PATH,
        help = "Path of the controller JSON config"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        env = "ERDMA_CONTROLLER_CREDENTIAL",
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_CREDENTIAL_PATH,
        help = "Path of the access key credential file"
    )]
    pub credential: PathBuf,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "PUBLIC_NETWORK",
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Use the public ECS endpoint instead of the VPC endpoint"
    )]
    pub public_network: bool,

    #[arg(
        long,
        default_value = "10",
        help = "Seconds between status reconciles while devices are not ready"
    )]
    pub requeue_seconds: u64,
}

/// Controller settings read from the mounted config file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    pub region: String,
    #[serde(rename = "manageNonOwnedERIs")]
    pub manage_non_owned_eris: bool,
    pub node_selector: Option<BTreeMap<String, String>>,
    pub enable_device_plugin: bool,
    pub cluster_domain: String,
    pub controller_namespace: String,
    pub controller_name: String,
}

impl ControllerConfig {
    pub fn load(path: &Path) -> Result<Self, Report<ConfigError>> {
        let raw = std::fs::read_to_string(path).change_context(ConfigError::Read {
            path: path.display().to_string(),
        })?;
        Self::parse(&raw).attach_printable_lazy(|| format!("config path: {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self, Report<ConfigError>> {
        serde_json::from_str(raw).change_context(ConfigError::Parse {
            path: "<inline>".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn parses_camel_case_config() {
        let cfg = ControllerConfig::parse(
            r#"{
                "region": "cn-beijing",
                "manageNonOwnedERIs": true,
                "nodeSelector": {"node.kubernetes.io/erdma": "true"},
                "enableDevicePlugin": true,
                "controllerNamespace": "kube-system"
            }"#,
        )
        .expect("should parse config");
        assert_eq!(cfg.region, "cn-beijing");
        assert!(cfg.manage_non_owned_eris);
        assert!(cfg.enable_device_plugin);
        assert_eq!(
            cfg.node_selector
                .as_ref()
                .and_then(|s| s.get("node.kubernetes.io/erdma"))
                .map(String::as_str),
            Some("true")
        );
        assert_eq!(cfg.controller_namespace, "kube-system");
        assert_eq!(cfg.cluster_domain, "");
    }

    #[test]
    fn empty_object_uses_defaults() {
        let cfg = ControllerConfig::parse("{}").expect("should parse config");
        assert_eq!(cfg, ControllerConfig::default());
        assert!(cfg.node_selector.is_none());
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let err = ControllerConfig::load(&dir.path().join("missing.json"))
            .expect_err("missing file should fail");
        assert!(matches!(err.current_context(), ConfigError::Read { .. }));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().expect("should create temp file");
        write!(file, r#"{{"region":"cn-shanghai"}}"#).expect("should write config");
        let cfg = ControllerConfig::load(file.path()).expect("should load config");
        assert_eq!(cfg.region, "cn-shanghai");
    }
}
