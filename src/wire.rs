//! JSON shape a snapshot travels in between collector and server, and what the
//! query API returns. Addresses are plain strings; empty means absent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    parse_mac, parse_optional_prefix, Device, Interface, PrefixParseError, Snapshot, SnapshotId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SnapshotId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub devices: Vec<WireDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireDevice {
    pub hostname: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub os_name: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub management_ip: String,
    pub snapshot_successful: bool,
    #[serde(default)]
    pub interfaces: Vec<WireInterface>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireInterface {
    pub name: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub mtu: i64,
    #[serde(default)]
    pub bandwidth: i64,
    #[serde(default)]
    pub up: bool,
}

/// Body of a `201 Created` answer to a snapshot upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Created {
    pub id: SnapshotId,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid snapshot JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("device {device}: invalid address '{value}': {source}")]
    Prefix {
        device: String,
        value: String,
        source: PrefixParseError,
    },
    #[error("device {device}: invalid MAC address '{value}'")]
    Mac { device: String, value: String },
    #[error("device without hostname")]
    MissingHostname,
}

pub fn encode(snapshot: &Snapshot) -> WireSnapshot {
    WireSnapshot {
        id: snapshot.id,
        timestamp: snapshot.timestamp,
        devices: snapshot.devices.iter().map(encode_device).collect(),
    }
}

fn encode_device(device: &Device) -> WireDevice {
    WireDevice {
        hostname: device.hostname.clone(),
        vendor: device.vendor.clone(),
        os_name: device.os_name.clone(),
        os_version: device.os_version.clone(),
        serial: device.serial.clone(),
        management_ip: device
            .management_ip
            .map(|p| p.to_string())
            .unwrap_or_default(),
        snapshot_successful: device.snapshot_successful,
        interfaces: device
            .interfaces
            .iter()
            .map(|i| WireInterface {
                name: i.name.clone(),
                mac: i.mac.map(|m| m.to_string()).unwrap_or_default(),
                ip: i.ip.map(|p| p.to_string()).unwrap_or_default(),
                mtu: i.mtu,
                bandwidth: i.bandwidth,
                up: i.up,
            })
            .collect(),
    }
}

/// An address with no prefix length decodes to "no address" and an interface
/// without a name is dropped; any other malformed address or MAC rejects the
/// whole snapshot.
pub fn decode(wire: WireSnapshot) -> Result<Snapshot, WireError> {
    let devices = wire
        .devices
        .into_iter()
        .map(decode_device)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Snapshot {
        id: wire.id,
        timestamp: wire.timestamp,
        devices,
    })
}

fn decode_device(wire: WireDevice) -> Result<Device, WireError> {
    if wire.hostname.trim().is_empty() {
        return Err(WireError::MissingHostname);
    }
    let prefix = |value: &str| {
        parse_optional_prefix(value).map_err(|source| WireError::Prefix {
            device: wire.hostname.clone(),
            value: value.to_string(),
            source,
        })
    };

    let management_ip = prefix(&wire.management_ip)?;
    let mut interfaces = Vec::with_capacity(wire.interfaces.len());
    for iface in &wire.interfaces {
        if iface.name.trim().is_empty() {
            continue;
        }
        let mac = match iface.mac.trim() {
            "" => None,
            text => Some(parse_mac(text).ok_or_else(|| WireError::Mac {
                device: wire.hostname.clone(),
                value: text.to_string(),
            })?),
        };
        interfaces.push(Interface {
            name: iface.name.clone(),
            mac,
            ip: prefix(&iface.ip)?,
            up: iface.up,
            mtu: iface.mtu,
            bandwidth: iface.bandwidth,
        });
    }

    Ok(Device {
        hostname: wire.hostname.clone(),
        vendor: wire.vendor.clone(),
        os_name: wire.os_name.clone(),
        os_version: wire.os_version.clone(),
        serial: wire.serial.clone(),
        management_ip,
        snapshot_successful: wire.snapshot_successful,
        interfaces,
    })
}

pub fn to_json(snapshot: &Snapshot) -> Result<String, WireError> {
    Ok(serde_json::to_string_pretty(&encode(snapshot))?)
}

pub fn from_json(text: &str) -> Result<Snapshot, WireError> {
    decode(serde_json::from_str(text)?)
}
