use std::fmt;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use tracing::info;

use crate::config::ConfigError;

pub const ENV_ACCESS_KEY_ID: &str = "ALIBABA_CLOUD_ACCESS_KEY_ID";
pub const ENV_ACCESS_KEY_SECRET: &str = "ALIBABA_CLOUD_ACCESS_KEY_SECRET";

/// A secret string that never shows up in logs.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Sensitive(String);

impl Sensitive {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Sensitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("*******")
    }
}

impl fmt::Display for Sensitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("*******")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Credential {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "accessKeyID")]
    pub access_key_id: Sensitive,
    #[serde(rename = "accessKeySecret")]
    pub access_key_secret: Sensitive,
    #[serde(rename = "securityToken")]
    pub security_token: Option<Sensitive>,
}

impl Credential {
    /// Reads the credential file. A missing file yields an empty credential
    /// that is then filled from the environment.
    pub fn load(path: &Path) -> Result<Self, Report<ConfigError>> {
        let mut credential = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).change_context(ConfigError::Parse {
                path: path.display().to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("credential file {} not found, using environment", path.display());
                Self::default()
            }
            Err(e) => {
                return Err(Report::new(e).change_context(ConfigError::Read {
                    path: path.display().to_string(),
                }))
            }
        };
        credential.fill_from_env(|key| std::env::var(key).ok());
        Ok(credential)
    }

    fn fill_from_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.access_key_id.is_empty() {
            if let Some(v) = lookup(ENV_ACCESS_KEY_ID) {
                self.access_key_id = Sensitive::new(v);
            }
        }
        if self.access_key_secret.is_empty() {
            if let Some(v) = lookup(ENV_ACCESS_KEY_SECRET) {
                self.access_key_secret = Sensitive::new(v);
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.access_key_id.is_empty() && !self.access_key_secret.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn secrets_are_masked() {
        let credential = Credential {
            kind: "access_key".to_string(),
            access_key_id: Sensitive::new("LTAI-id"),
            access_key_secret: Sensitive::new("very-secret"),
            security_token: None,
        };
        let printed = format!("{credential:?}");
        assert!(!printed.contains("very-secret"));
        assert!(!printed.contains("LTAI-id"));
        assert_eq!(credential.access_key_secret.to_string(), "*******");
    }

    #[test]
    fn parses_credential_file() {
        let mut file = tempfile::NamedTempFile::new().expect("should create temp file");
        write!(
            file,
            r#"{{"type":"access_key","accessKeyID":"ak","accessKeySecret":"sk","securityToken":"tok"}}"#
        )
        .expect("should write credential");
        let credential = Credential::load(file.path()).expect("should load credential");
        assert_eq!(credential.kind, "access_key");
        assert_eq!(credential.access_key_id.expose(), "ak");
        assert_eq!(credential.access_key_secret.expose(), "sk");
        assert_eq!(
            credential.security_token.as_ref().map(Sensitive::expose),
            Some("tok")
        );
    }

    #[test]
    fn environment_fills_missing_keys() {
        let mut credential = Credential::default();
        credential.fill_from_env(|key| match key {
            ENV_ACCESS_KEY_ID => Some("env-ak".to_string()),
            ENV_ACCESS_KEY_SECRET => Some("env-sk".to_string()),
            _ => None,
        });
        assert!(credential.is_complete());
        assert_eq!(credential.access_key_id.expose(), "env-ak");

        let mut from_file = Credential {
            access_key_id: Sensitive::new("file-ak"),
            ..Default::default()
        };
        from_file.fill_from_env(|_| Some("env".to_string()));
        assert_eq!(from_file.access_key_id.expose(), "file-ak");
        assert_eq!(from_file.access_key_secret.expose(), "env");
    }
}
