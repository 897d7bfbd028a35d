// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Scripted lock clients loaded from TOML.
//!
//! A scenario is a list of `[[client]]` tables. Every client issues one lock
//! request after its start delay and then follows its plan: unlock after
//! `hold`, cancel after `cancel`, upgrade and downgrade for upgradable locks.

use crate::error::{ResmutexError, Result};
use crate::locking::LockMode;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

const DEFAULT_RESOURCE: &str = "resource";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScenario {
    #[serde(default, rename = "client")]
    clients: Vec<RawClient>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawClient {
    name: String,
    #[serde(default = "default_resource")]
    resource: String,
    mode: String,
    start: Option<String>,
    hold: Option<String>,
    timeout: Option<String>,
    cancel: Option<String>,
    upgrade: Option<String>,
    downgrade: Option<String>,
}

fn default_resource() -> String {
    DEFAULT_RESOURCE.to_string()
}

/// One scripted client. Delays other than `start` are measured from the
/// event they follow: `hold` and `upgrade` from the grant, `cancel` from the
/// request, `downgrade` from the completed upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPlan {
    pub name: String,
    pub resource: String,
    pub mode: LockMode,
    pub start: Duration,
    pub hold: Option<Duration>,
    pub timeout: Option<Duration>,
    pub cancel: Option<Duration>,
    pub upgrade: Option<Duration>,
    pub downgrade: Option<Duration>,
}

impl ClientPlan {
    /// Whether this client's request ends without outside help once granted,
    /// given the manager's default timeout.
    pub fn terminates(&self, default_timeout: Option<Duration>) -> bool {
        self.hold.is_some()
            || self.timeout.is_some_and(|timeout| !timeout.is_zero())
            || self.cancel.is_some()
            || default_timeout.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    pub clients: Vec<ClientPlan>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse_raw(&contents)
            .map_err(|e| ResmutexError::InvalidScenario(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Self::parse_raw(contents).map_err(ResmutexError::InvalidScenario)
    }

    fn parse_raw(contents: &str) -> std::result::Result<Self, String> {
        let raw: RawScenario = toml::from_str(contents).map_err(|e| e.to_string())?;
        if raw.clients.is_empty() {
            return Err("scenario declares no [[client]] entries".to_string());
        }

        let mut names = HashSet::new();
        let mut clients = Vec::with_capacity(raw.clients.len());
        for client in raw.clients {
            if client.name.trim().is_empty() {
                return Err("client names must not be empty".to_string());
            }
            if !names.insert(client.name.clone()) {
                return Err(format!("client '{}' is declared twice", client.name));
            }
            clients.push(plan(client)?);
        }

        Ok(Self { clients })
    }
}

fn plan(raw: RawClient) -> std::result::Result<ClientPlan, String> {
    let name = raw.name;
    let mode: LockMode = raw
        .mode
        .parse()
        .map_err(|e: ResmutexError| format!("client '{name}': {e}"))?;
    let start = duration(&name, "start", raw.start)?.unwrap_or_default();
    let hold = duration(&name, "hold", raw.hold)?;
    let timeout = duration(&name, "timeout", raw.timeout)?;
    let cancel = duration(&name, "cancel", raw.cancel)?;
    let upgrade = duration(&name, "upgrade", raw.upgrade)?;
    let downgrade = duration(&name, "downgrade", raw.downgrade)?;

    if mode != LockMode::Upgradable && (upgrade.is_some() || downgrade.is_some()) {
        return Err(format!(
            "client '{name}': upgrade and downgrade require mode 'upgradable', not '{mode}'"
        ));
    }
    if downgrade.is_some() && upgrade.is_none() {
        return Err(format!("client '{name}': downgrade requires an upgrade"));
    }

    Ok(ClientPlan {
        name,
        resource: raw.resource,
        mode,
        start,
        hold,
        timeout,
        cancel,
        upgrade,
        downgrade,
    })
}

fn duration(
    client: &str,
    label: &str,
    value: Option<String>,
) -> std::result::Result<Option<Duration>, String> {
    value
        .map(|text| {
            humantime::parse_duration(text.trim())
                .map_err(|e| format!("client '{client}': invalid {label} '{text}': {e}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_client() {
        let scenario = Scenario::parse_raw(
            r#"
[[client]]
name = "writer"
resource = "books"
mode = "upgradable"
start = "5ms"
hold = "1s"
timeout = "2s"
upgrade = "10ms"
downgrade = "20ms"

[[client]]
name = "reader"
mode = "Shared"
hold = "50ms"
"#,
        )
        .unwrap();

        let writer = &scenario.clients[0];
        assert_eq!(writer.mode, LockMode::Upgradable);
        assert_eq!(writer.start, Duration::from_millis(5));
        assert_eq!(writer.upgrade, Some(Duration::from_millis(10)));
        assert_eq!(writer.downgrade, Some(Duration::from_millis(20)));

        let reader = &scenario.clients[1];
        assert_eq!(reader.resource, "resource");
        assert_eq!(reader.mode, LockMode::Shared);
        assert_eq!(reader.start, Duration::ZERO);
    }

    #[test]
    fn rejects_unknown_mode() {
        let err = Scenario::parse_raw("[[client]]\nname = \"a\"\nmode = \"sharded\"\n").unwrap_err();
        assert!(err.contains("Unknown lock mode 'sharded'"), "{err}");
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = Scenario::parse_raw(
            "[[client]]\nname = \"a\"\nmode = \"shared\"\n[[client]]\nname = \"a\"\nmode = \"shared\"\n",
        )
        .unwrap_err();
        assert!(err.contains("declared twice"));
    }

    #[test]
    fn rejects_upgrade_on_shared_client() {
        let err = Scenario::parse_raw(
            "[[client]]\nname = \"a\"\nmode = \"shared\"\nupgrade = \"1ms\"\n",
        )
        .unwrap_err();
        assert!(err.contains("require mode 'upgradable'"));
    }

    #[test]
    fn rejects_downgrade_without_upgrade() {
        let err = Scenario::parse_raw(
            "[[client]]\nname = \"a\"\nmode = \"upgradable\"\ndowngrade = \"1ms\"\n",
        )
        .unwrap_err();
        assert!(err.contains("downgrade requires an upgrade"));
    }

    #[test]
    fn rejects_bad_duration_and_unknown_fields() {
        let err =
            Scenario::parse_raw("[[client]]\nname = \"a\"\nmode = \"shared\"\nhold = \"soon\"\n")
                .unwrap_err();
        assert!(err.contains("invalid hold 'soon'"));

        assert!(
            Scenario::parse_raw("[[client]]\nname = \"a\"\nmode = \"shared\"\nwait = \"1s\"\n")
                .is_err()
        );
    }

    #[test]
    fn rejects_empty_scenario() {
        assert!(matches!(
            Scenario::parse(""),
            Err(ResmutexError::InvalidScenario(_))
        ));
    }

    #[test]
    fn termination_considers_default_timeout() {
        let scenario = Scenario::parse_raw("[[client]]\nname = \"a\"\nmode = \"shared\"\n").unwrap();
        let client = &scenario.clients[0];
        assert!(!client.terminates(None));
        assert!(client.terminates(Some(Duration::from_secs(1))));

        let scenario = Scenario::parse_raw(
            "[[client]]\nname = \"a\"\nmode = \"shared\"\ntimeout = \"0s\"\n",
        )
        .unwrap();
        assert!(!scenario.clients[0].terminates(None));
    }
}
