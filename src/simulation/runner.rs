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

use crate::error::{ResmutexError, Result};
use crate::locking::{AnyGrant, LockManager, LockMode, LockTimeoutValue, RequestId};
use crate::simulation::scenario::{ClientPlan, Scenario};
use crate::simulation::trace::{TraceKind, TraceRecorder};
use colored::Colorize;
use log::debug;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time;

type Owners = Arc<Mutex<HashMap<RequestId, usize>>>;

/// One rendered event of a finished simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceLine {
    pub at_ms: u64,
    pub client: String,
    pub event: TraceKind,
    pub mode: LockMode,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationReport {
    pub lines: Vec<TraceLine>,
}

impl SimulationReport {
    /// Events of one client, in the order they happened.
    pub fn events_for(&self, client: &str) -> Vec<TraceKind> {
        self.lines
            .iter()
            .filter(|line| line.client == client)
            .map(|line| line.event)
            .collect()
    }

    /// `(client, event)` pairs across all clients, in order.
    pub fn sequence(&self) -> Vec<(&str, TraceKind)> {
        self.lines
            .iter()
            .map(|line| (line.client.as_str(), line.event))
            .collect()
    }

    pub fn render_text(&self, use_color: bool) -> String {
        let width = self
            .lines
            .iter()
            .map(|line| line.client.len())
            .max()
            .unwrap_or(0);

        let mut output = String::new();
        for line in &self.lines {
            let offset = format!("+{}ms", line.at_ms);
            let event = if use_color {
                paint(line.event).to_string()
            } else {
                line.event.to_string()
            };
            let subject = match line.event {
                TraceKind::Requested | TraceKind::Granted => {
                    format!("{} on \"{}\"", line.mode, line.resource)
                }
                _ => format!("on \"{}\"", line.resource),
            };
            output.push_str(&format!(
                "{offset:>8}  {client:<width$}  {event} {subject}\n",
                client = line.client
            ));
        }
        output
    }

    /// One JSON object per line.
    pub fn render_json(&self) -> Result<String> {
        let mut output = String::new();
        for line in &self.lines {
            output.push_str(&serde_json::to_string(line)?);
            output.push('\n');
        }
        Ok(output)
    }
}

fn paint(kind: TraceKind) -> colored::ColoredString {
    let label = kind.as_str();
    match kind {
        TraceKind::Requested => label.dimmed(),
        TraceKind::Granted => label.green().bold(),
        TraceKind::UpgradeRequested | TraceKind::Upgraded | TraceKind::Downgraded => {
            label.magenta()
        }
        TraceKind::Unlocked => label.cyan(),
        TraceKind::Cancelled => label.yellow(),
        TraceKind::TimedOut => label.red().bold(),
    }
}

/// Replays a [`Scenario`] against a fresh [`LockManager`].
#[derive(Debug)]
pub struct Simulation {
    scenario: Scenario,
    default_timeout: LockTimeoutValue,
}

impl Simulation {
    pub fn new(scenario: Scenario, default_timeout: LockTimeoutValue) -> Result<Self> {
        if let Some(client) = scenario
            .clients
            .iter()
            .find(|client| !client.terminates(default_timeout.as_option()))
        {
            return Err(ResmutexError::InvalidScenario(format!(
                "client '{}' never releases its lock; give it a hold, timeout or cancel delay, \
                 or set a default timeout",
                client.name
            )));
        }

        Ok(Self {
            scenario,
            default_timeout,
        })
    }

    /// Runs every client to completion and returns the ordered trace.
    pub async fn run(self) -> Result<SimulationReport> {
        let recorder = Arc::new(TraceRecorder::new());
        let manager = LockManager::builder()
            .default_timeout(self.default_timeout)
            .observer(recorder.clone())
            .build()?;
        let owners: Owners = Arc::default();

        debug!(
            "Simulating {} client(s) with default timeout {}",
            self.scenario.clients.len(),
            self.default_timeout
        );

        let mut clients = JoinSet::new();
        for (index, plan) in self.scenario.clients.iter().cloned().enumerate() {
            clients.spawn(run_client(manager.clone(), plan, index, owners.clone()));
        }

        recorder.wait_finished(self.scenario.clients.len()).await;
        clients.abort_all();

        let owners = owners.lock().unwrap_or_else(PoisonError::into_inner);
        let lines = recorder
            .events()
            .into_iter()
            .filter_map(|event| {
                let plan = &self.scenario.clients[*owners.get(&event.request)?];
                Some(TraceLine {
                    at_ms: u64::try_from(event.at.as_millis()).unwrap_or(u64::MAX),
                    client: plan.name.clone(),
                    event: event.kind,
                    mode: plan.mode,
                    resource: event.resource,
                })
            })
            .collect();

        Ok(SimulationReport { lines })
    }
}

async fn run_client(manager: LockManager, plan: ClientPlan, index: usize, owners: Owners) {
    // Clients starting at zero request in declaration order.
    if !plan.start.is_zero() {
        time::sleep(plan.start).await;
    }

    let (sender, receiver) = oneshot::channel();
    let handle = manager.acquire(
        plan.resource.clone(),
        plan.mode,
        move |grant| {
            let _ = sender.send(grant);
        },
        plan.timeout,
    );
    owners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(handle.id(), index);

    let cancel = async {
        if let Some(after) = plan.cancel {
            time::sleep(after).await;
            handle.cancel();
        }
    };
    let granted = async {
        // A withdrawn request drops its callback, closing the channel.
        if let Ok(grant) = receiver.await {
            follow(grant, &plan).await;
        }
    };
    tokio::join!(cancel, granted);
}

async fn follow(grant: AnyGrant, plan: &ClientPlan) {
    let hold = async {
        if let Some(hold) = plan.hold {
            time::sleep(hold).await;
            grant.unlock();
        }
    };
    let upgrade = async {
        let (Some(after), Some(upgradable)) = (plan.upgrade, grant.clone().into_upgradable())
        else {
            return;
        };
        time::sleep(after).await;

        let upgraded = match upgradable.upgrade_async().await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!("Client '{}' did not upgrade: {e}", plan.name);
                return;
            }
        };
        if let Some(after) = plan.downgrade {
            time::sleep(after).await;
            if let Err(e) = upgraded.downgrade_async().await {
                debug!("Client '{}' did not downgrade: {e}", plan.name);
            }
        }
    };
    tokio::join!(hold, upgrade);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(at_ms: u64, client: &str, event: TraceKind) -> TraceLine {
        TraceLine {
            at_ms,
            client: client.to_string(),
            event,
            mode: LockMode::Exclusive,
            resource: "r".to_string(),
        }
    }

    #[test]
    fn text_rendering_aligns_clients() {
        let report = SimulationReport {
            lines: vec![
                line(0, "A", TraceKind::Granted),
                line(12, "writer", TraceKind::Unlocked),
            ],
        };
        let text = report.render_text(false);
        let rendered: Vec<&str> = text.lines().collect();
        assert_eq!(rendered[0], "    +0ms  A       granted exclusive on \"r\"");
        assert_eq!(rendered[1], "   +12ms  writer  unlocked on \"r\"");
    }

    #[test]
    fn json_rendering_emits_one_object_per_line() {
        let report = SimulationReport {
            lines: vec![line(3, "A", TraceKind::TimedOut)],
        };
        let json = report.render_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(json.trim()).unwrap();
        assert_eq!(value["event"], "timed-out");
        assert_eq!(value["mode"], "exclusive");
        assert_eq!(value["at_ms"], 3);
    }

    #[test]
    fn never_releasing_client_is_rejected() {
        let scenario = Scenario::parse("[[client]]\nname = \"a\"\nmode = \"shared\"\n").unwrap();
        let err = Simulation::new(scenario.clone(), LockTimeoutValue::Infinite).unwrap_err();
        assert!(err.to_string().contains("client 'a' never releases"));

        assert!(Simulation::new(scenario, LockTimeoutValue::from_secs(1)).is_ok());
    }
}
