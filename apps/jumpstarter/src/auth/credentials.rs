use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::auth::error::AuthError;

pub const API_VERSION: &str = "jumpstarter.dev/v1alpha1";
pub const CLIENT_CONFIG_KIND: &str = "ClientConfig";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Client credentials as written by the login flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    CLIENT_CONFIG_KIND.to_string()
}

impl ClientConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: name.into(),
                namespace: None,
            },
            endpoint: None,
            token: None,
            refresh_token: None,
        }
    }

    pub fn with_tokens(mut self, token: impl Into<String>, refresh_token: Option<String>) -> Self {
        self.token = Some(token.into());
        self.refresh_token = refresh_token;
        self
    }

    pub fn clients_dir() -> Result<PathBuf, AuthError> {
        let dirs = ProjectDirs::from("dev", "jumpstarter", "jumpstarter")
            .ok_or_else(|| AuthError::Config("unable to determine config directory".into()))?;
        Ok(dirs.config_dir().join("clients"))
    }

    /// Default location of the config saved under `alias`.
    pub fn path_for(alias: &str) -> Result<PathBuf, AuthError> {
        Ok(Self::clients_dir()?.join(format!("{alias}.toml")))
    }

    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Like [`load`](Self::load) but a missing file is `None`.
    pub fn load_if_exists(path: &Path) -> Result<Option<Self>, AuthError> {
        if !path.exists() {
            return Ok(None);
        }
        Self::load(path).map(Some)
    }

    /// Writes the config readable by the owner only.
    pub fn save(&self, path: &Path) -> Result<(), AuthError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let serialized = toml::to_string_pretty(self)?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(serialized.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata()?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_keep_camel_case_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clients").join("default.toml");
        let mut config = ClientConfig::new("default").with_tokens("access", Some("refresh".into()));
        config.endpoint = Some("grpc.example.com:443".into());
        config.save(&path).expect("save");

        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("apiVersion = \"jumpstarter.dev/v1alpha1\""));
        assert!(raw.contains("refreshToken = \"refresh\""));
        assert_eq!(ClientConfig::load(&path).expect("load"), config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: ClientConfig = toml::from_str("token = \"abc\"\n").expect("parse");
        assert_eq!(config.api_version, API_VERSION);
        assert_eq!(config.kind, CLIENT_CONFIG_KIND);
        assert_eq!(config.token.as_deref(), Some("abc"));
        assert_eq!(config.refresh_token, None);
    }

    #[test]
    fn load_if_exists_tolerates_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.toml");
        assert_eq!(ClientConfig::load_if_exists(&missing).expect("load"), None);
    }
}
