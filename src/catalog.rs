use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::session::{Auth, ConnectionParams};
use crate::templates::{CommandTemplate, TemplateRegistry};

/// One entry of the targets file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub os: String,
    pub hostname: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub no_strict_host_key_check: bool,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// A target resolved against the template registry, ready to probe.
#[derive(Debug, Clone)]
pub struct Target {
    pub os: String,
    pub vendor: String,
    pub params: ConnectionParams,
    pub commands: Arc<[CommandTemplate]>,
}

impl Target {
    pub fn hostname(&self) -> &str {
        &self.params.hostname
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read targets file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse JSON in {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("target #{index}: {field} is required")]
    MissingField { index: usize, field: &'static str },
    #[error("target {hostname}: unknown operating system '{os}'")]
    UnknownOs { hostname: String, os: String },
    #[error("target {0}: either password or private_key_path is required")]
    MissingCredential(String),
    #[error("target {0} is listed more than once")]
    DuplicateHostname(String),
}

pub fn load_targets(path: impl AsRef<Path>) -> Result<Vec<TargetConfig>, CatalogError> {
    let path_ref = path.as_ref();
    let path_display = path_ref.display().to_string();
    let text = fs::read_to_string(path_ref).map_err(|source| CatalogError::Read {
        path: path_display.clone(),
        source,
    })?;

    if path_ref.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&text).map_err(|source| CatalogError::Json {
            path: path_display,
            source,
        })
    } else {
        serde_yaml::from_str(&text).map_err(|source| CatalogError::Yaml {
            path: path_display,
            source,
        })
    }
}

/// Validates every entry and resolves its vendor and command list. Fails on the
/// first bad entry; nothing is probed from a partially valid catalog.
pub fn build_catalog(
    configs: Vec<TargetConfig>,
    registry: &TemplateRegistry,
) -> Result<Vec<Target>, CatalogError> {
    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(configs.len());

    for (index, cfg) in configs.into_iter().enumerate() {
        let hostname = cfg.hostname.trim().to_string();
        if hostname.is_empty() {
            return Err(CatalogError::MissingField {
                index,
                field: "hostname",
            });
        }
        if cfg.username.trim().is_empty() {
            return Err(CatalogError::MissingField {
                index,
                field: "username",
            });
        }
        if cfg.os.trim().is_empty() {
            return Err(CatalogError::MissingField { index, field: "os" });
        }

        let profile = registry
            .lookup(&cfg.os)
            .ok_or_else(|| CatalogError::UnknownOs {
                hostname: hostname.clone(),
                os: cfg.os.clone(),
            })?;

        let auth = match cfg.private_key_path {
            Some(path) => Auth::Key {
                path,
                passphrase: cfg.passphrase.filter(|p| !p.is_empty()),
                password: Some(cfg.password).filter(|p| !p.is_empty()),
            },
            None if !cfg.password.is_empty() => Auth::Password(cfg.password),
            None => return Err(CatalogError::MissingCredential(hostname)),
        };

        if !seen.insert(hostname.clone()) {
            return Err(CatalogError::DuplicateHostname(hostname));
        }

        targets.push(Target {
            os: cfg.os,
            vendor: profile.vendor.clone(),
            params: ConnectionParams {
                hostname,
                port: cfg.port,
                username: cfg.username,
                auth,
                strict_host_key_check: !cfg.no_strict_host_key_check,
            },
            commands: profile.commands.clone(),
        });
    }

    Ok(targets)
}

pub fn load_catalog(
    path: impl AsRef<Path>,
    registry: &TemplateRegistry,
) -> Result<Vec<Target>, CatalogError> {
    build_catalog(load_targets(path)?, registry)
}

const fn default_port() -> u16 {
    22
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::NOKIA_SRLINUX;

    fn entry(hostname: &str) -> TargetConfig {
        TargetConfig {
            os: NOKIA_SRLINUX.to_string(),
            hostname: hostname.to_string(),
            username: "admin".to_string(),
            password: "NokiaSrl1!".to_string(),
            private_key_path: None,
            passphrase: None,
            no_strict_host_key_check: false,
            port: 22,
        }
    }

    #[test]
    fn loads_json_and_resolves_vendor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        fs::write(
            &path,
            r#"[
                {"os": "nokia_srlinux", "hostname": "leaf1", "username": "admin",
                 "password": "NokiaSrl1!", "no_strict_host_key_check": true},
                {"os": "nokia_srlinux", "hostname": "leaf2", "username": "admin",
                 "private_key_path": "/keys/id_ed25519", "port": 830}
            ]"#,
        )
        .unwrap();

        let targets = load_catalog(&path, &TemplateRegistry::builtin()).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].vendor, "Nokia");
        assert_eq!(targets[0].commands.len(), 2);
        assert!(!targets[0].params.strict_host_key_check);
        assert_eq!(targets[0].params.port, 22);
        assert_eq!(targets[1].params.port, 830);
        assert!(matches!(
            targets[1].params.auth,
            Auth::Key {
                passphrase: None,
                password: None,
                ..
            }
        ));
    }

    #[test]
    fn password_is_kept_next_to_a_key() {
        let mut both = entry("r1");
        both.private_key_path = Some(PathBuf::from("/keys/id_ed25519"));
        both.passphrase = Some("s3cret".to_string());

        let targets = build_catalog(vec![both], &TemplateRegistry::builtin()).unwrap();
        assert_eq!(
            targets[0].params.auth,
            Auth::Key {
                path: PathBuf::from("/keys/id_ed25519"),
                passphrase: Some("s3cret".to_string()),
                password: Some("NokiaSrl1!".to_string()),
            }
        );
        assert_eq!(targets[0].params.auth.password(), Some("NokiaSrl1!"));
    }

    #[test]
    fn loads_yaml_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.yaml");
        fs::write(
            &path,
            "- os: nokia_srlinux\n  hostname: spine1\n  username: admin\n  password: x\n",
        )
        .unwrap();

        let configs = load_targets(&path).unwrap();
        assert_eq!(configs[0].hostname, "spine1");
        assert!(configs[0].private_key_path.is_none());
    }

    #[test]
    fn unknown_os_fails_fast() {
        let mut cfg = entry("r1");
        cfg.os = "cisco_ios".to_string();
        let err = build_catalog(vec![entry("r0"), cfg], &TemplateRegistry::builtin()).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownOs { ref os, .. } if os == "cisco_ios"));
    }

    #[test]
    fn credentials_and_identity_are_required() {
        let registry = TemplateRegistry::builtin();

        let mut no_secret = entry("r1");
        no_secret.password.clear();
        assert!(matches!(
            build_catalog(vec![no_secret], &registry),
            Err(CatalogError::MissingCredential(_))
        ));

        let mut no_user = entry("r1");
        no_user.username = " ".to_string();
        assert!(matches!(
            build_catalog(vec![no_user], &registry),
            Err(CatalogError::MissingField { field: "username", .. })
        ));

        assert!(matches!(
            build_catalog(vec![entry("r1"), entry("r1")], &registry),
            Err(CatalogError::DuplicateHostname(_))
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_targets("/nonexistent/targets.json").unwrap_err();
        assert!(matches!(err, CatalogError::Read { .. }));
    }
}
