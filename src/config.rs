//! Server configuration: the multi-server map, legacy single-server shape,
//! and load-time normalization between the two.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::DbtError;
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// How a credential value is resolved, in precedence order: an explicit
/// shell command wins, then a file path, then a static value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl CredentialSource {
    pub fn is_absent(&self) -> bool {
        self.shell.is_none() && self.file.is_none() && self.value.is_none()
    }

    /// Resolves to a concrete credential string, preferring shell command
    /// output over a file's contents over the static value.
    pub fn resolve(&self) -> Result<Option<String>> {
        if let Some(cmd) = &self.shell {
            let output = std::process::Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .output()
                .with_context(|| format!("running credential shell command: {cmd}"))?;
            if !output.status.success() {
                return Err(DbtError::Auth(format!(
                    "credential shell command exited with {}: {cmd}",
                    output.status
                ))
                .into());
            }
            let mut s = String::from_utf8_lossy(&output.stdout).to_string();
            while s.ends_with('\n') || s.ends_with('\r') {
                s.pop();
            }
            return Ok(Some(s));
        }
        if let Some(path) = &self.file {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("reading credential file {path}"))?;
            return Ok(Some(contents.trim_end_matches(['\n', '\r']).to_string()));
        }
        if let Some(value) = &self.value {
            return Ok(Some(value.clone()));
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "CredentialSource::is_absent")]
    pub username: CredentialSource,
    #[serde(default, skip_serializing_if = "CredentialSource::is_absent")]
    pub password: CredentialSource,
    #[serde(default, skip_serializing_if = "CredentialSource::is_absent")]
    pub public_key: CredentialSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_bearer_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OidcConfig {
    pub issuer_url: String,
    pub audience: String,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub connector_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub base_url: String,
    pub truststore_url: String,
    pub tools_url: String,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub oidc: Option<OidcConfig>,
}

/// The normalized, in-memory configuration: every server, keyed by name,
/// plus which one is the default. The legacy single-server shape is folded
/// into this at load time and never carried past the loader.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MultiServerConfig {
    pub servers: IndexMap<String, ServerConfig>,
    #[serde(rename = "defaultServer", skip_serializing_if = "Option::is_none")]
    pub default_server: Option<String>,
}

/// The legacy on-disk shape: a single server record with no name, nested
/// under `dbt`/`tools` rather than a `servers` map.
#[derive(Debug, Clone, Deserialize)]
struct LegacyConfig {
    dbt: LegacyDbtSection,
    tools: LegacyToolsSection,
    #[serde(default)]
    credentials: Credentials,
    #[serde(default)]
    oidc: Option<OidcConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct LegacyDbtSection {
    repository: String,
    truststore: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LegacyToolsSection {
    repository: String,
}

const LEGACY_SERVER_NAME: &str = "default";

fn normalize_legacy(legacy: LegacyConfig) -> MultiServerConfig {
    let server = ServerConfig {
        base_url: legacy.dbt.repository,
        truststore_url: legacy.dbt.truststore,
        tools_url: legacy.tools.repository,
        credentials: legacy.credentials,
        oidc: legacy.oidc,
    };
    let mut servers = IndexMap::new();
    servers.insert(LEGACY_SERVER_NAME.to_string(), server);
    MultiServerConfig {
        servers,
        default_server: Some(LEGACY_SERVER_NAME.to_string()),
    }
}

/// `<home>/.dbt/conf/dbt.json`
pub fn config_path(home: &Path) -> PathBuf {
    home.join(".dbt").join("conf").join("dbt.json")
}

/// Loads and normalizes the configuration file. A missing file yields an
/// empty multi-server map (server selection then fails later with a
/// `ConfigError` naming the problem); malformed JSON is a `ConfigError`
/// raised immediately.
pub fn load(home: &Path) -> Result<MultiServerConfig> {
    let path = config_path(home);
    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(MultiServerConfig::default())
        }
        Err(e) => {
            return Err(DbtError::Config(format!(
                "reading {}: {e}",
                path.display()
            ))
            .into())
        }
    };

    parse(&contents).map_err(|e| DbtError::Config(format!("{} is invalid: {e}", path.display())).into())
}

fn parse(contents: &str) -> Result<MultiServerConfig> {
    // Multi-server shape is tried first since it's the only shape that can
    // carry more than one server; legacy is the fallback.
    if let Ok(multi) = serde_json::from_str::<MultiServerConfig>(contents) {
        if !multi.servers.is_empty() {
            return Ok(multi);
        }
    }
    let legacy: LegacyConfig =
        serde_json::from_str(contents).context("neither multi-server nor legacy shape matched")?;
    Ok(normalize_legacy(legacy))
}

pub fn save(home: &Path, config: &MultiServerConfig) -> Result<()> {
    let path = config_path(home);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(config)?;
    fs::write(&path, contents)?;
    Ok(())
}

/// Selects the active server by priority: explicit CLI argument, then
/// `DBT_SERVER`, then `defaultServer`, then the first entry in insertion
/// (here: key) order.
pub fn select_server<'a>(
    config: &'a MultiServerConfig,
    cli_server: Option<&str>,
    env_server: Option<&str>,
) -> Result<(&'a str, &'a ServerConfig)> {
    let name = cli_server
        .or(env_server)
        .or(config.default_server.as_deref())
        .or_else(|| config.servers.keys().next().map(|s| s.as_str()));

    let name = name.ok_or_else(|| DbtError::Config("no server configured".to_string()))?;
    let server = config
        .servers
        .get(name)
        .ok_or_else(|| DbtError::Config(format!("server {name} not found in configuration")))?;
    Ok((name, server))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_shape_normalizes_to_single_server_map() {
        let raw = r#"{
            "dbt": {"repository": "https://dbt.example/dbt", "truststore": "https://dbt.example/truststore"},
            "tools": {"repository": "https://dbt.example/tools"}
        }"#;
        let config = parse(raw).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.default_server.as_deref(), Some("default"));
        let server = &config.servers["default"];
        assert_eq!(server.base_url, "https://dbt.example/dbt");
    }

    #[test]
    fn multi_server_shape_round_trips() {
        let mut servers = IndexMap::new();
        servers.insert(
            "prod".to_string(),
            ServerConfig {
                base_url: "https://prod/dbt".into(),
                truststore_url: "https://prod/truststore".into(),
                tools_url: "https://prod/tools".into(),
                credentials: Credentials::default(),
                oidc: None,
            },
        );
        let config = MultiServerConfig {
            servers,
            default_server: Some("prod".to_string()),
        };
        let saved = serde_json::to_string(&config).unwrap();
        let reloaded = parse(&saved).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn missing_file_yields_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(dir.path()).unwrap();
        assert!(config.servers.is_empty());
    }

    #[test]
    fn malformed_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{ not json").unwrap();
        assert!(load(dir.path()).is_err());
    }

    #[test]
    fn selection_priority_cli_beats_env_beats_default_beats_first() {
        let mut servers = IndexMap::new();
        for name in ["alpha", "beta", "gamma"] {
            servers.insert(
                name.to_string(),
                ServerConfig {
                    base_url: format!("https://{name}/dbt"),
                    truststore_url: format!("https://{name}/truststore"),
                    tools_url: format!("https://{name}/tools"),
                    credentials: Credentials::default(),
                    oidc: None,
                },
            );
        }
        let config = MultiServerConfig {
            servers,
            default_server: Some("gamma".to_string()),
        };

        let (name, _) = select_server(&config, Some("alpha"), Some("beta")).unwrap();
        assert_eq!(name, "alpha");

        let (name, _) = select_server(&config, None, Some("beta")).unwrap();
        assert_eq!(name, "beta");

        let (name, _) = select_server(&config, None, None).unwrap();
        assert_eq!(name, "gamma");
    }

    #[test]
    fn no_default_falls_back_to_insertion_order_not_alphabetical() {
        let mut servers = IndexMap::new();
        for name in ["zeta", "alpha"] {
            servers.insert(
                name.to_string(),
                ServerConfig {
                    base_url: format!("https://{name}/dbt"),
                    truststore_url: format!("https://{name}/truststore"),
                    tools_url: format!("https://{name}/tools"),
                    credentials: Credentials::default(),
                    oidc: None,
                },
            );
        }
        let config = MultiServerConfig {
            servers,
            default_server: None,
        };

        let (name, _) = select_server(&config, None, None).unwrap();
        assert_eq!(name, "zeta", "first inserted, not first alphabetically");
    }

    #[test]
    fn credential_precedence_shell_then_file_then_static() {
        let source = CredentialSource {
            shell: Some("echo from-shell".to_string()),
            file: None,
            value: Some("from-static".to_string()),
        };
        assert_eq!(source.resolve().unwrap().as_deref(), Some("from-shell"));
    }
}
