//! Scripted collaborators and SR Linux fixtures for unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{build_catalog, Target, TargetConfig};
use crate::session::{ConnectionParams, Session, SessionError, SessionFactory};
use crate::templates::{TemplateRegistry, NOKIA_SRLINUX};

pub const SHOW_INTERFACE_DETAIL: &str = "\
====================================================================
Interface: ethernet-1/1
--------------------------------------------------------------------
  Description     : to-spine1
  Oper state      : up
  Down reason     : N/A
  Last change     : 2h5m ago, 1 flaps since last clear
  Speed           : 25G
  Flow control    : Rx is disabled, Tx is disabled
  MTU             : 9232
  VLAN tagging    : false
  Queues          : 8 output queues supported, 3 used since the last clear
  MAC address     : 1A:B0:00:FF:00:01
  Last stats clear: never
--------------------------------------------------------------------
  Subinterface: ethernet-1/1.0
    IPv4 addr    : 192.168.11.1/30 (static, preferred, primary)
====================================================================
Interface: mgmt0
--------------------------------------------------------------------
  Oper state      : down
  Speed           : 1G
  MTU             : 1514
  MAC address     : 1A:B0:00:FF:00:00
====================================================================
";

pub fn show_version(hostname: &str) -> String {
    format!(
        "\
--------------------------------------------------------------------
Hostname             : {hostname}
Chassis Type         : 7220 IXR-D2
Part Number          : Sim Part No.
Serial Number        : Sim Serial No.
System HW MAC Address: 1A:B0:00:FF:00:00
Software Version     : v23.10.1
Build Number         : 218-ga3fc1bea5a
Architecture         : x86_64
Last Booted          : 2024-01-10T09:12:44.118Z
Total Memory         : 24052875 kB
Free Memory          : 19327424 kB
--------------------------------------------------------------------
"
    )
}

pub type Outputs = HashMap<String, Result<String, String>>;

pub fn srl_outputs(hostname: &str) -> Outputs {
    HashMap::from([
        ("show version".to_string(), Ok(show_version(hostname))),
        (
            "show interface detail".to_string(),
            Ok(SHOW_INTERFACE_DETAIL.to_string()),
        ),
    ])
}

pub fn srl_target(hostname: &str) -> Target {
    let cfg = TargetConfig {
        os: NOKIA_SRLINUX.to_string(),
        hostname: hostname.to_string(),
        username: "admin".to_string(),
        password: "NokiaSrl1!".to_string(),
        private_key_path: None,
        passphrase: None,
        no_strict_host_key_check: true,
        port: 22,
    };
    build_catalog(vec![cfg], &TemplateRegistry::builtin())
        .unwrap()
        .remove(0)
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub open_fails: bool,
    pub delay: Duration,
    pub command_delay: Duration,
    pub panics: bool,
    pub outputs: Outputs,
}

impl Script {
    pub fn ok(outputs: Outputs) -> Self {
        Self {
            outputs,
            ..Self::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            open_fails: true,
            ..Self::default()
        }
    }

    /// Delay applied inside `open`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Delay applied inside every `send_command`, after the session is open.
    pub fn slow_commands(mut self, delay: Duration) -> Self {
        self.command_delay = delay;
        self
    }

    /// Panics on the first command.
    pub fn panicking() -> Self {
        Self {
            panics: true,
            ..Self::default()
        }
    }
}

/// Hands out sessions that replay a per-host script. Hosts without a script
/// behave as unreachable. `dropped` counts sessions released by drop while
/// still open.
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: HashMap<String, Script>,
    pub closed: Arc<AtomicUsize>,
    pub dropped: Arc<AtomicUsize>,
    pub in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn with(mut self, hostname: &str, script: Script) -> Self {
        self.scripts.insert(hostname.to_string(), script);
        self
    }
}

impl SessionFactory for ScriptedFactory {
    fn connect(&self, params: &ConnectionParams) -> Box<dyn Session> {
        Box::new(ScriptedSession {
            hostname: params.hostname.clone(),
            script: self
                .scripts
                .get(&params.hostname)
                .cloned()
                .unwrap_or_else(Script::unreachable),
            active: false,
            closed: self.closed.clone(),
            dropped: self.dropped.clone(),
            in_flight: self.in_flight.clone(),
            max_in_flight: self.max_in_flight.clone(),
        })
    }
}

struct ScriptedSession {
    hostname: String,
    script: Script,
    active: bool,
    closed: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn open(&mut self) -> Result<(), SessionError> {
        self.active = true;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.script.delay).await;
        if self.script.open_fails {
            return Err(SessionError::Failed {
                host: self.hostname.clone(),
                action: "connect",
                status: "exit status: 255".to_string(),
                stderr: "Connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> Result<String, SessionError> {
        if self.script.panics {
            panic!("scripted session for {} panicked", self.hostname);
        }
        tokio::time::sleep(self.script.command_delay).await;
        match self.script.outputs.get(command) {
            Some(Ok(output)) => Ok(output.clone()),
            Some(Err(stderr)) => Err(SessionError::Failed {
                host: self.hostname.clone(),
                action: "command",
                status: "exit status: 1".to_string(),
                stderr: stderr.clone(),
            }),
            None => Ok(String::new()),
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if self.active {
            self.active = false;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        if self.active {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }
}
