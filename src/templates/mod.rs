pub mod textfsm;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use textfsm::TextFsm;

/// One parsed output row: template value name -> captured text.
pub type Record = HashMap<String, String>;

pub const NOKIA_SRLINUX: &str = "nokia_srlinux";

const TEMPLATE_EXTENSION: &str = "textfsm";

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    (
        "nokia_srlinux_show_version",
        include_str!("../../templates/nokia_srlinux_show_version.textfsm"),
    ),
    (
        "nokia_srlinux_show_interface_detail",
        include_str!("../../templates/nokia_srlinux_show_interface_detail.textfsm"),
    ),
];

/// Field kinds a template may extract. Anything else in a record is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Hostname,
    Os,
    Version,
    Serial,
    ManagementIp,
    Interface,
    State,
    MacAddress,
    Ipv4,
    Mtu,
    Bandwidth,
}

impl Field {
    pub const fn column(self) -> &'static str {
        match self {
            Field::Hostname => "HOSTNAME",
            Field::Os => "OS",
            Field::Version => "VERSION",
            Field::Serial => "SERIAL",
            Field::ManagementIp => "MANAGEMENT_IP",
            Field::Interface => "INTERFACE",
            Field::State => "STATE",
            Field::MacAddress => "MAC_ADDRESS",
            Field::Ipv4 => "IPV4",
            Field::Mtu => "MTU",
            Field::Bandwidth => "BANDWIDTH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub command: String,
    pub template: String,
    pub fields: Vec<Field>,
}

impl CommandTemplate {
    fn new(command: &str, template: &str, fields: &[Field]) -> Self {
        Self {
            command: command.to_string(),
            template: template.to_string(),
            fields: fields.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OsProfile {
    pub vendor: String,
    pub commands: Arc<[CommandTemplate]>,
}

/// OS tag -> vendor and ordered command list. Built once at startup and shared
/// read-only with the catalog and prober.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    profiles: HashMap<String, OsProfile>,
}

impl TemplateRegistry {
    pub fn builtin() -> Self {
        Self::default().with_profile(
            NOKIA_SRLINUX,
            "Nokia",
            vec![
                CommandTemplate::new(
                    "show version",
                    "nokia_srlinux_show_version",
                    &[Field::Hostname, Field::Version, Field::Serial],
                ),
                CommandTemplate::new(
                    "show interface detail",
                    "nokia_srlinux_show_interface_detail",
                    &[
                        Field::Interface,
                        Field::State,
                        Field::MacAddress,
                        Field::Ipv4,
                        Field::Mtu,
                        Field::Bandwidth,
                    ],
                ),
            ],
        )
    }

    pub fn with_profile(mut self, os: &str, vendor: &str, commands: Vec<CommandTemplate>) -> Self {
        self.profiles.insert(
            os.to_string(),
            OsProfile {
                vendor: vendor.to_string(),
                commands: commands.into(),
            },
        );
        self
    }

    pub fn lookup(&self, os: &str) -> Option<&OsProfile> {
        self.profiles.get(os)
    }

    pub fn os_tags(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("template {name} line {line}: {reason}")]
    Compile {
        name: String,
        line: usize,
        reason: String,
    },
    #[error("unknown template {0}")]
    Unknown(String),
    #[error("template {name} declares no value {column}")]
    MissingColumn { name: String, column: &'static str },
    #[error("template {name} rejected output line {line}: {text}")]
    Rejected {
        name: String,
        line: usize,
        text: String,
    },
}

/// Parses raw command output into records using a named template.
pub trait OutputParser: Send + Sync {
    fn parse(&self, template: &str, raw: &str) -> Result<Vec<Record>, TemplateError>;
}

/// Compiled TextFSM templates keyed by name (file stem).
#[derive(Debug, Default)]
pub struct TemplateLibrary {
    templates: HashMap<String, TextFsm>,
}

impl TemplateLibrary {
    pub fn builtin() -> Result<Self, TemplateError> {
        let mut library = Self::default();
        for (name, source) in BUILTIN_TEMPLATES {
            library.insert(name, source)?;
        }
        Ok(library)
    }

    /// Embedded templates, then every `*.textfsm` file in `dir` replacing the
    /// template with the same stem.
    pub fn load(dir: Option<&Path>) -> Result<Self, TemplateError> {
        let mut library = Self::builtin()?;
        let Some(dir) = dir else {
            return Ok(library);
        };

        let read_err = |path: &Path, source| TemplateError::Read {
            path: path.display().to_string(),
            source,
        };
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|source| read_err(dir, source))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == TEMPLATE_EXTENSION))
            .collect();
        paths.sort();

        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source = fs::read_to_string(&path).map_err(|source| read_err(&path, source))?;
            library.insert(name, &source)?;
            info!(template = %name, path = %path.display(), "loaded template override");
        }
        Ok(library)
    }

    fn insert(&mut self, name: &str, source: &str) -> Result<(), TemplateError> {
        let fsm = TextFsm::compile(source).map_err(|err| TemplateError::Compile {
            name: name.to_string(),
            line: err.line,
            reason: err.reason,
        })?;
        self.templates.insert(name.to_string(), fsm);
        Ok(())
    }

    /// Every template the registry references must exist and declare the
    /// columns its command template extracts.
    pub fn check(&self, registry: &TemplateRegistry) -> Result<(), TemplateError> {
        for os in registry.os_tags() {
            let Some(profile) = registry.lookup(os) else {
                continue;
            };
            for command in profile.commands.iter() {
                let fsm = self
                    .templates
                    .get(&command.template)
                    .ok_or_else(|| TemplateError::Unknown(command.template.clone()))?;
                for field in &command.fields {
                    if !fsm.value_names().any(|v| v == field.column()) {
                        return Err(TemplateError::MissingColumn {
                            name: command.template.clone(),
                            column: field.column(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl OutputParser for TemplateLibrary {
    fn parse(&self, template: &str, raw: &str) -> Result<Vec<Record>, TemplateError> {
        let fsm = self
            .templates
            .get(template)
            .ok_or_else(|| TemplateError::Unknown(template.to_string()))?;
        let records = fsm.parse(raw).map_err(|err| TemplateError::Rejected {
            name: template.to_string(),
            line: err.line,
            text: err.text,
        })?;
        debug!(template = %template, records = records.len(), "parsed command output");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{show_version, SHOW_INTERFACE_DETAIL};

    #[test]
    fn builtin_library_covers_builtin_registry() {
        let library = TemplateLibrary::builtin().unwrap();
        library.check(&TemplateRegistry::builtin()).unwrap();
    }

    #[test]
    fn parses_srlinux_show_version() {
        let library = TemplateLibrary::builtin().unwrap();
        let records = library
            .parse("nokia_srlinux_show_version", &show_version("leaf1"))
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["HOSTNAME"], "leaf1");
        assert_eq!(records[0]["VERSION"], "v23.10.1");
        assert_eq!(records[0]["SERIAL"], "Sim Serial No.");
    }

    #[test]
    fn parses_srlinux_show_interface_detail() {
        let library = TemplateLibrary::builtin().unwrap();
        let records = library
            .parse("nokia_srlinux_show_interface_detail", SHOW_INTERFACE_DETAIL)
            .unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first["INTERFACE"], "ethernet-1/1");
        assert_eq!(first["STATE"], "up");
        assert_eq!(first["BANDWIDTH"], "25G");
        assert_eq!(first["MTU"], "9232");
        assert_eq!(first["MAC_ADDRESS"], "1A:B0:00:FF:00:01");
        assert_eq!(first["IPV4"], "192.168.11.1/30");

        let mgmt = &records[1];
        assert_eq!(mgmt["INTERFACE"], "mgmt0");
        assert_eq!(mgmt["STATE"], "down");
        assert_eq!(mgmt["IPV4"], "");
    }

    #[test]
    fn unknown_template_is_an_error() {
        let library = TemplateLibrary::builtin().unwrap();
        assert!(matches!(
            library.parse("nope", ""),
            Err(TemplateError::Unknown(_))
        ));
    }

    #[test]
    fn directory_overrides_builtin_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("nokia_srlinux_show_version.textfsm"),
            "Value HOSTNAME (\\S+)\n\nStart\n  ^name ${HOSTNAME} -> Record\n",
        )
        .unwrap();
        fs::write(dir.path().join("README"), "not a template").unwrap();

        let library = TemplateLibrary::load(Some(dir.path())).unwrap();
        let records = library
            .parse("nokia_srlinux_show_version", "name spine9\n")
            .unwrap();
        assert_eq!(records[0]["HOSTNAME"], "spine9");

        // Override dropped the OS/VERSION/SERIAL columns the registry expects.
        assert!(matches!(
            library.check(&TemplateRegistry::builtin()),
            Err(TemplateError::MissingColumn { .. })
        ));
    }

    #[test]
    fn registry_lookup() {
        let registry = TemplateRegistry::builtin();
        let profile = registry.lookup(NOKIA_SRLINUX).unwrap();
        assert_eq!(profile.vendor, "Nokia");
        assert_eq!(profile.commands[0].command, "show version");
        assert!(registry.lookup("cisco_ios").is_none());
    }
}
