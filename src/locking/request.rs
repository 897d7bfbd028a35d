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

//! Per-request lifecycle tracking.
//!
//! Every lock request owns a [`RequestTicket`] shared by its cancel handle,
//! its grant values and the pending callback delivery. The ticket carries the
//! request through `Queued -> Granted -> Released` (or `Cancelled`), so
//! cancellation never depends on closures observing state assigned later.

use crate::locking::mode::LockMode;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Unique identifier of a lock request within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a single lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Queued,
    Granted,
    Released,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Released | RequestState::Cancelled)
    }
}

/// Why a granted lock stopped being held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseReason {
    Unlocked,
    TimedOut,
    Cancelled,
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReleaseReason::Unlocked => "unlocked",
            ReleaseReason::TimedOut => "timed out",
            ReleaseReason::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug)]
struct TicketState {
    state: RequestState,
    granted_at: Option<Instant>,
    expiry: Option<AbortHandle>,
}

/// Shared lifecycle record for one lock request.
///
/// Transitions are only performed by the manager while it holds the resource
/// table lock; readers may observe the state at any time.
#[derive(Debug)]
pub(crate) struct RequestTicket {
    id: RequestId,
    mode: LockMode,
    resource: Arc<str>,
    requested_at: Instant,
    inner: Mutex<TicketState>,
}

impl RequestTicket {
    pub(crate) fn new(id: RequestId, mode: LockMode, resource: Arc<str>) -> Self {
        Self {
            id,
            mode,
            resource,
            requested_at: Instant::now(),
            inner: Mutex::new(TicketState {
                state: RequestState::Queued,
                granted_at: None,
                expiry: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TicketState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn mode(&self) -> LockMode {
        self.mode
    }

    pub(crate) fn resource(&self) -> &str {
        &self.resource
    }

    pub(crate) fn state(&self) -> RequestState {
        self.lock().state
    }

    /// Moves a queued request to `Granted` and returns how long it waited.
    pub(crate) fn mark_granted(&self) -> Option<Duration> {
        let mut inner = self.lock();
        if inner.state != RequestState::Queued {
            return None;
        }
        let now = Instant::now();
        inner.state = RequestState::Granted;
        inner.granted_at = Some(now);
        Some(now.saturating_duration_since(self.requested_at))
    }

    pub(crate) fn attach_expiry(&self, handle: AbortHandle) {
        let mut inner = self.lock();
        if inner.state == RequestState::Granted {
            inner.expiry = Some(handle);
        } else {
            handle.abort();
        }
    }

    /// Ends a granted request, disarming its expiry timer first.
    ///
    /// Returns how long the lock was held, or `None` when the request was not
    /// in the `Granted` state.
    pub(crate) fn mark_released(&self, reason: ReleaseReason) -> Option<Duration> {
        let mut inner = self.lock();
        if inner.state != RequestState::Granted {
            return None;
        }
        if let Some(expiry) = inner.expiry.take() {
            expiry.abort();
        }
        inner.state = match reason {
            ReleaseReason::Cancelled => RequestState::Cancelled,
            ReleaseReason::Unlocked | ReleaseReason::TimedOut => RequestState::Released,
        };
        Some(
            inner
                .granted_at
                .map(|granted_at| granted_at.elapsed())
                .unwrap_or_default(),
        )
    }

    /// Ends a request that never left the queue.
    pub(crate) fn mark_withdrawn(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != RequestState::Queued {
            return false;
        }
        inner.state = RequestState::Cancelled;
        true
    }
}
