use chrono::{DateTime, SubsecRound, Utc};
use mac_address::MacAddress;
use std::fmt;
use std::net::{AddrParseError, IpAddr};
use std::str::FromStr;
use thiserror::Error;

pub type SnapshotId = i64;

/// One fleet-wide capture.
///
/// `id` is `None` until the store has assigned one; a snapshot read back for an
/// unknown id is `Snapshot::default()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub id: Option<SnapshotId>,
    pub timestamp: DateTime<Utc>,
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Device {
    pub hostname: String,
    pub vendor: String,
    pub os_name: String,
    pub os_version: String,
    pub serial: String,
    pub management_ip: Option<IpPrefix>,
    pub snapshot_successful: bool,
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub mac: Option<MacAddress>,
    pub ip: Option<IpPrefix>,
    pub up: bool,
    pub mtu: i64,
    /// Mbit/s.
    pub bandwidth: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SnapshotRecord {
    pub id: SnapshotId,
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    /// Capture time is truncated to microseconds, the resolution the store keeps.
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            id: None,
            timestamp: timestamp.trunc_subsecs(6),
            devices: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.devices.is_empty()
    }
}

impl Device {
    /// Stub recorded when the remote session could not be opened; identity comes
    /// from the catalog entry only.
    pub fn unreachable(hostname: &str, vendor: &str, os_name: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            vendor: vendor.to_string(),
            os_name: os_name.to_string(),
            snapshot_successful: false,
            ..Self::default()
        }
    }
}

/// Address plus prefix length, e.g. `10.0.0.1/30`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPrefix {
    addr: IpAddr,
    len: u8,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrefixParseError {
    #[error("prefix '{0}' has no '/'")]
    MissingLength(String),
    #[error("invalid address in prefix '{input}': {source}")]
    Addr {
        input: String,
        source: AddrParseError,
    },
    #[error("invalid prefix length in '{0}'")]
    Length(String),
}

impl IpPrefix {
    pub fn new(addr: IpAddr, len: u8) -> Option<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (len <= max).then_some(Self { addr, len })
    }
}

impl FromStr for IpPrefix {
    type Err = PrefixParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| PrefixParseError::MissingLength(s.to_string()))?;
        let addr: IpAddr = addr.parse().map_err(|source| PrefixParseError::Addr {
            input: s.to_string(),
            source,
        })?;
        let len: u8 = len
            .parse()
            .map_err(|_| PrefixParseError::Length(s.to_string()))?;
        Self::new(addr, len).ok_or_else(|| PrefixParseError::Length(s.to_string()))
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// Empty text and an address without a prefix length both mean "no address";
/// anything else must be a valid prefix.
pub fn parse_optional_prefix(input: &str) -> Result<Option<IpPrefix>, PrefixParseError> {
    match input.trim().parse::<IpPrefix>() {
        Ok(prefix) => Ok(Some(prefix)),
        Err(PrefixParseError::MissingLength(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` and `aabb.ccdd.eeff`.
pub fn parse_mac(input: &str) -> Option<MacAddress> {
    let input = input.trim();
    if !input.contains('.') {
        return input.parse().ok();
    }

    let groups: Vec<&str> = input.split('.').collect();
    let is_group = |g: &&str| g.len() == 4 && g.chars().all(|c| c.is_ascii_hexdigit());
    if groups.len() != 3 || !groups.iter().all(is_group) {
        return None;
    }
    let digits = groups.concat();
    let mut bytes = [0_u8; 6];
    for (i, byte) in bytes.iter_mut().enumerate() {
        let pair = digits.get(i * 2..i * 2 + 2)?;
        *byte = u8::from_str_radix(pair, 16).ok()?;
    }
    Some(MacAddress::new(bytes))
}
