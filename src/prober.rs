use mac_address::MacAddress;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::Target;
use crate::model::{parse_mac, Device, Interface, IpPrefix};
use crate::session::{Session, SessionError, SessionFactory};
use crate::templates::{Field, OutputParser, Record, TemplateError};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("command '{command}' failed: {source}")]
    Command {
        command: String,
        source: SessionError,
    },
    #[error("parsing output of '{command}' failed: {source}")]
    Parse {
        command: String,
        source: TemplateError,
    },
    #[error("field {column} has invalid value '{value}': {reason}")]
    Field {
        column: &'static str,
        value: String,
        reason: String,
    },
}

impl ProbeError {
    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::Command { .. } => "command",
            ProbeError::Parse { .. } => "parse",
            ProbeError::Field { .. } => "field",
        }
    }
}

/// A parsed record value after decoding into its field kind.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldValue {
    Hostname(String),
    Os(String),
    Version(String),
    Serial(String),
    ManagementIp(IpPrefix),
    Interface(String),
    Up(bool),
    Mac(MacAddress),
    Ipv4(IpPrefix),
    Mtu(i64),
    Bandwidth(i64),
}

/// Runs one target's command list over a fresh session and folds the parsed
/// records into a `Device`.
#[derive(Clone)]
pub struct Prober {
    sessions: Arc<dyn SessionFactory>,
    parser: Arc<dyn OutputParser>,
}

impl Prober {
    pub fn new(sessions: Arc<dyn SessionFactory>, parser: Arc<dyn OutputParser>) -> Self {
        Self { sessions, parser }
    }

    /// A session that cannot be opened yields an unsuccessful stub device, not
    /// an error. Anything failing after that aborts the probe.
    pub async fn probe(&self, target: &Target) -> Result<Device, ProbeError> {
        let host = target.hostname();
        let mut session = self.sessions.connect(&target.params);

        info!(host = %host, "connecting");
        if let Err(err) = session.open().await {
            warn!(host = %host, error = %err, "session open failed");
            close(session.as_mut(), host).await;
            return Ok(Device::unreachable(host, &target.vendor, &target.os));
        }

        let result = self.run_commands(session.as_mut(), target).await;
        close(session.as_mut(), host).await;
        let facts = result?;

        let mut device = facts.into_device(target);
        device.snapshot_successful = true;
        debug!(host = %host, interfaces = device.interfaces.len(), "probe finished");
        Ok(device)
    }

    async fn run_commands(
        &self,
        session: &mut dyn Session,
        target: &Target,
    ) -> Result<Facts, ProbeError> {
        let mut facts = Facts::default();
        for command in target.commands.iter() {
            debug!(host = %target.hostname(), command = %command.command, "sending command");
            let raw = session
                .send_command(&command.command)
                .await
                .map_err(|source| ProbeError::Command {
                    command: command.command.clone(),
                    source,
                })?;
            let records = self
                .parser
                .parse(&command.template, &raw)
                .map_err(|source| ProbeError::Parse {
                    command: command.command.clone(),
                    source,
                })?;
            for record in &records {
                facts.apply(&decode_record(&command.fields, record)?);
            }
        }
        Ok(facts)
    }
}

async fn close(session: &mut dyn Session, host: &str) {
    if let Err(err) = session.close().await {
        warn!(host = %host, error = %err, "session close failed");
    }
}

/// Device-reported facts. Each slot keeps the first non-empty value seen.
#[derive(Debug, Default)]
struct Facts {
    hostname: Option<String>,
    os_name: Option<String>,
    os_version: Option<String>,
    serial: Option<String>,
    management_ip: Option<IpPrefix>,
    interfaces: Vec<PartialInterface>,
}

#[derive(Debug, Default)]
struct PartialInterface {
    name: String,
    mac: Option<MacAddress>,
    ip: Option<IpPrefix>,
    up: Option<bool>,
    mtu: Option<i64>,
    bandwidth: Option<i64>,
}

impl PartialInterface {
    fn merge(&mut self, other: PartialInterface) {
        self.mac = self.mac.or(other.mac);
        self.ip = self.ip.or(other.ip);
        self.up = self.up.or(other.up);
        self.mtu = self.mtu.or(other.mtu);
        self.bandwidth = self.bandwidth.or(other.bandwidth);
    }
}

impl Facts {
    fn apply(&mut self, values: &[FieldValue]) {
        let mut iface = PartialInterface::default();
        for value in values {
            match value {
                FieldValue::Hostname(v) => fill(&mut self.hostname, v),
                FieldValue::Os(v) => fill(&mut self.os_name, v),
                FieldValue::Version(v) => fill(&mut self.os_version, v),
                FieldValue::Serial(v) => fill(&mut self.serial, v),
                FieldValue::ManagementIp(p) => {
                    if self.management_ip.is_none() {
                        self.management_ip = Some(*p);
                    }
                }
                FieldValue::Interface(name) => iface.name = name.clone(),
                FieldValue::Up(up) => iface.up = Some(*up),
                FieldValue::Mac(mac) => iface.mac = Some(*mac),
                FieldValue::Ipv4(p) => iface.ip = Some(*p),
                FieldValue::Mtu(mtu) => iface.mtu = Some(*mtu),
                FieldValue::Bandwidth(bw) => iface.bandwidth = Some(*bw),
            }
        }

        // Interface fields without a name cannot be attributed to anything.
        if iface.name.is_empty() {
            return;
        }
        match self.interfaces.iter_mut().find(|i| i.name == iface.name) {
            Some(existing) => existing.merge(iface),
            None => self.interfaces.push(iface),
        }
    }

    fn into_device(self, target: &Target) -> Device {
        Device {
            hostname: self.hostname.unwrap_or_else(|| target.hostname().to_string()),
            vendor: target.vendor.clone(),
            os_name: self.os_name.unwrap_or_else(|| target.os.clone()),
            os_version: self.os_version.unwrap_or_default(),
            serial: self.serial.unwrap_or_default(),
            management_ip: self.management_ip,
            snapshot_successful: false,
            interfaces: self
                .interfaces
                .into_iter()
                .map(|i| Interface {
                    name: i.name,
                    mac: i.mac,
                    ip: i.ip,
                    up: i.up.unwrap_or(false),
                    mtu: i.mtu.unwrap_or(0),
                    bandwidth: i.bandwidth.unwrap_or(0),
                })
                .collect(),
        }
    }
}

fn fill(slot: &mut Option<String>, value: &str) {
    if slot.is_none() {
        *slot = Some(value.to_string());
    }
}

fn decode_record(fields: &[Field], record: &Record) -> Result<Vec<FieldValue>, ProbeError> {
    let mut values = Vec::with_capacity(fields.len());
    for &field in fields {
        let Some(raw) = record.get(field.column()) else {
            continue;
        };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        values.push(decode_field(field, raw)?);
    }
    Ok(values)
}

fn decode_field(field: Field, raw: &str) -> Result<FieldValue, ProbeError> {
    let invalid = |reason: String| ProbeError::Field {
        column: field.column(),
        value: raw.to_string(),
        reason,
    };

    let value = match field {
        Field::Hostname => FieldValue::Hostname(raw.to_string()),
        Field::Os => FieldValue::Os(raw.to_string()),
        Field::Version => FieldValue::Version(raw.to_string()),
        Field::Serial => FieldValue::Serial(raw.to_string()),
        Field::Interface => FieldValue::Interface(raw.to_string()),
        Field::ManagementIp => {
            FieldValue::ManagementIp(raw.parse().map_err(|e| invalid(format!("{e}")))?)
        }
        Field::Ipv4 => FieldValue::Ipv4(raw.parse().map_err(|e| invalid(format!("{e}")))?),
        Field::State => match raw.to_ascii_lowercase().as_str() {
            "up" => FieldValue::Up(true),
            "down" => FieldValue::Up(false),
            _ => return Err(invalid("expected up or down".to_string())),
        },
        Field::MacAddress => FieldValue::Mac(
            parse_mac(raw).ok_or_else(|| invalid("not a MAC address".to_string()))?,
        ),
        Field::Mtu => FieldValue::Mtu(
            raw.parse::<i64>()
                .map_err(|e| invalid(format!("{e}")))?,
        ),
        Field::Bandwidth => FieldValue::Bandwidth(parse_bandwidth(raw).ok_or_else(|| {
            invalid("expected an integer with optional K/M/G/T suffix".to_string())
        })?),
    };
    Ok(value)
}

/// Speed in Mbit/s. A bare number is already Mbit/s; `25G`, `100M`,
/// `400Gbps` and `10000K` are scaled.
pub fn parse_bandwidth(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let lower = raw.to_ascii_lowercase();
    let trimmed = lower
        .strip_suffix("bps")
        .or_else(|| lower.strip_suffix("b/s"))
        .unwrap_or(&lower);
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(digits_end);
    let number: i64 = number.parse().ok()?;

    match unit.trim() {
        "" | "m" => Some(number),
        "k" => Some(number / 1_000),
        "g" => number.checked_mul(1_000),
        "t" => number.checked_mul(1_000_000),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::TemplateLibrary;
    use crate::testing::{srl_outputs, srl_target, ScriptedFactory, Script};

    fn prober(factory: ScriptedFactory) -> Prober {
        let library = TemplateLibrary::builtin().unwrap();
        Prober::new(Arc::new(factory), Arc::new(library))
    }

    #[tokio::test]
    async fn probes_srlinux_device() {
        let factory = ScriptedFactory::default().with("leaf1", Script::ok(srl_outputs("leaf1")));
        let closed = factory.closed.clone();
        let device = prober(factory).probe(&srl_target("leaf1")).await.unwrap();

        assert!(device.snapshot_successful);
        assert_eq!(device.hostname, "leaf1");
        assert_eq!(device.vendor, "Nokia");
        assert_eq!(device.os_name, "nokia_srlinux");
        assert_eq!(device.os_version, "v23.10.1");
        assert_eq!(device.serial, "Sim Serial No.");
        assert_eq!(device.interfaces.len(), 2);

        let e1 = &device.interfaces[0];
        assert_eq!(e1.name, "ethernet-1/1");
        assert!(e1.up);
        assert_eq!(e1.mtu, 9232);
        assert_eq!(e1.bandwidth, 25_000);
        assert_eq!(e1.ip.map(|p| p.to_string()).as_deref(), Some("192.168.11.1/30"));
        assert_eq!(e1.mac, parse_mac("1A:B0:00:FF:00:01"));

        let mgmt = &device.interfaces[1];
        assert!(!mgmt.up);
        assert_eq!(mgmt.ip, None);
        assert_eq!(closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_failure_yields_stub_and_still_closes() {
        let factory = ScriptedFactory::default().with("r2", Script::unreachable());
        let closed = factory.closed.clone();
        let device = prober(factory).probe(&srl_target("r2")).await.unwrap();

        assert_eq!(device, Device::unreachable("r2", "Nokia", "nokia_srlinux"));
        assert_eq!(closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn command_failure_aborts_probe() {
        let mut outputs = srl_outputs("leaf1");
        outputs.insert(
            "show interface detail".to_string(),
            Err("permission denied".to_string()),
        );
        let factory = ScriptedFactory::default().with("leaf1", Script::ok(outputs));
        let closed = factory.closed.clone();
        let err = prober(factory).probe(&srl_target("leaf1")).await.unwrap_err();

        assert_eq!(err.kind(), "command");
        assert_eq!(closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_mtu_aborts_probe() {
        let mut outputs = srl_outputs("leaf1");
        outputs.insert(
            "show interface detail".to_string(),
            Ok("Interface: ethernet-1/1\n  MTU             : 99999999999999999999\n".to_string()),
        );
        let factory = ScriptedFactory::default().with("leaf1", Script::ok(outputs));
        let err = prober(factory).probe(&srl_target("leaf1")).await.unwrap_err();
        assert!(matches!(err, ProbeError::Field { column: "MTU", .. }));
    }

    #[test]
    fn records_merge_by_interface_name_without_overwriting() {
        let mut facts = Facts::default();
        facts.apply(&[
            FieldValue::Interface("e1".to_string()),
            FieldValue::Mtu(1500),
        ]);
        facts.apply(&[
            FieldValue::Interface("e1".to_string()),
            FieldValue::Mtu(9000),
            FieldValue::Up(true),
        ]);
        facts.apply(&[FieldValue::Mtu(42), FieldValue::Hostname("r1".to_string())]);
        facts.apply(&[FieldValue::Hostname("ignored".to_string())]);

        assert_eq!(facts.interfaces.len(), 1);
        assert_eq!(facts.interfaces[0].mtu, Some(1500));
        assert_eq!(facts.interfaces[0].up, Some(true));
        assert_eq!(facts.hostname.as_deref(), Some("r1"));
    }

    #[test]
    fn decodes_fields_strictly() {
        assert_eq!(
            decode_field(Field::State, "UP").unwrap(),
            FieldValue::Up(true)
        );
        assert!(decode_field(Field::State, "testing").is_err());
        assert!(decode_field(Field::Ipv4, "10.0.0.1").is_err());
        assert!(decode_field(Field::MacAddress, "not-a-mac").is_err());
        assert!(decode_field(Field::Bandwidth, "fast").is_err());
    }

    #[test]
    fn bandwidth_is_normalised_to_mbps() {
        assert_eq!(parse_bandwidth("25G"), Some(25_000));
        assert_eq!(parse_bandwidth("400Gbps"), Some(400_000));
        assert_eq!(parse_bandwidth("100M"), Some(100));
        assert_eq!(parse_bandwidth("1000"), Some(1000));
        assert_eq!(parse_bandwidth("10000K"), Some(10));
        assert_eq!(parse_bandwidth("1T"), Some(1_000_000));
        assert_eq!(parse_bandwidth("G"), None);
        assert_eq!(parse_bandwidth("10X"), None);
    }
}
