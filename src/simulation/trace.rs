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

use crate::locking::{LockMode, LockObserver, LoggingObserver, ReleaseReason, RequestId};
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraceKind {
    Requested,
    Granted,
    UpgradeRequested,
    Upgraded,
    Downgraded,
    Unlocked,
    Cancelled,
    TimedOut,
}

impl TraceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceKind::Requested => "requested",
            TraceKind::Granted => "granted",
            TraceKind::UpgradeRequested => "upgrade-requested",
            TraceKind::Upgraded => "upgraded",
            TraceKind::Downgraded => "downgraded",
            TraceKind::Unlocked => "unlocked",
            TraceKind::Cancelled => "cancelled",
            TraceKind::TimedOut => "timed-out",
        }
    }

    /// The request is over once one of these has been recorded.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TraceKind::Unlocked | TraceKind::Cancelled | TraceKind::TimedOut
        )
    }
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ReleaseReason> for TraceKind {
    fn from(reason: ReleaseReason) -> Self {
        match reason {
            ReleaseReason::Unlocked => TraceKind::Unlocked,
            ReleaseReason::TimedOut => TraceKind::TimedOut,
            ReleaseReason::Cancelled => TraceKind::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub at: Duration,
    pub request: RequestId,
    pub resource: String,
    pub kind: TraceKind,
}

/// Observer that timestamps lock events and counts finished requests.
///
/// Events are also forwarded to [`LoggingObserver`] so `-v` shows them.
pub struct TraceRecorder {
    started: Instant,
    events: Mutex<Vec<TraceEvent>>,
    finished: watch::Sender<usize>,
    log: LoggingObserver,
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceRecorder {
    pub fn new() -> Self {
        let (finished, _) = watch::channel(0);
        Self {
            started: Instant::now(),
            events: Mutex::new(Vec::new()),
            finished,
            log: LoggingObserver,
        }
    }

    fn lock_events(&self) -> MutexGuard<'_, Vec<TraceEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, resource: &str, request: RequestId, kind: TraceKind) {
        self.lock_events().push(TraceEvent {
            at: self.started.elapsed(),
            request,
            resource: resource.to_string(),
            kind,
        });
        if kind.is_terminal() {
            self.finished.send_modify(|count| *count += 1);
        }
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.lock_events().clone()
    }

    /// Resolves once `count` requests have reached a terminal event.
    pub async fn wait_finished(&self, count: usize) {
        let mut finished = self.finished.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = finished.wait_for(|done| *done >= count).await;
    }
}

impl LockObserver for TraceRecorder {
    fn on_requested(&self, resource: &str, id: RequestId, mode: LockMode) {
        self.log.on_requested(resource, id, mode);
        self.push(resource, id, TraceKind::Requested);
    }

    fn on_queued(&self, resource: &str, id: RequestId, mode: LockMode, position: usize) {
        self.log.on_queued(resource, id, mode, position);
    }

    fn on_granted(&self, resource: &str, id: RequestId, mode: LockMode, waited: Duration) {
        self.log.on_granted(resource, id, mode, waited);
        self.push(resource, id, TraceKind::Granted);
    }

    fn on_released(
        &self,
        resource: &str,
        id: RequestId,
        mode: LockMode,
        reason: ReleaseReason,
        held: Duration,
    ) {
        self.log.on_released(resource, id, mode, reason, held);
        self.push(resource, id, reason.into());
    }

    fn on_withdrawn(&self, resource: &str, id: RequestId, mode: LockMode) {
        self.log.on_withdrawn(resource, id, mode);
        self.push(resource, id, TraceKind::Cancelled);
    }

    fn on_upgrade_requested(&self, resource: &str, id: RequestId, blocking_readers: usize) {
        self.log.on_upgrade_requested(resource, id, blocking_readers);
        self.push(resource, id, TraceKind::UpgradeRequested);
    }

    fn on_upgraded(&self, resource: &str, id: RequestId) {
        self.log.on_upgraded(resource, id);
        self.push(resource, id, TraceKind::Upgraded);
    }

    fn on_downgraded(&self, resource: &str, id: RequestId) {
        self.log.on_downgraded(resource, id);
        self.push(resource, id, TraceKind::Downgraded);
    }
}
