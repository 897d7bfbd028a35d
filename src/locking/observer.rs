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

//! Observer interfaces for lock lifecycle instrumentation.
//!
//! Observers decouple the `LockManager` from logging and tooling so callers can
//! watch contention without wrapping every callback. Hooks run after the
//! resource table has been unlocked, in the order the transitions happened.
//! They must not block.

use crate::locking::mode::LockMode;
use crate::locking::request::{ReleaseReason, RequestId};
use log::{debug, info, trace, warn};
use std::time::Duration;

/// Observer hooks for lock lifecycle events.
pub trait LockObserver: Send + Sync {
    fn on_requested(&self, _resource: &str, _id: RequestId, _mode: LockMode) {}

    fn on_queued(&self, _resource: &str, _id: RequestId, _mode: LockMode, _position: usize) {}

    fn on_granted(&self, _resource: &str, _id: RequestId, _mode: LockMode, _waited: Duration) {}

    fn on_released(
        &self,
        _resource: &str,
        _id: RequestId,
        _mode: LockMode,
        _reason: ReleaseReason,
        _held: Duration,
    ) {
    }

    /// A request was cancelled before it was granted.
    fn on_withdrawn(&self, _resource: &str, _id: RequestId, _mode: LockMode) {}

    fn on_upgrade_requested(&self, _resource: &str, _id: RequestId, _blocking_readers: usize) {}

    fn on_upgraded(&self, _resource: &str, _id: RequestId) {}

    fn on_downgraded(&self, _resource: &str, _id: RequestId) {}
}

/// Observer implementation that performs no work.
#[derive(Debug, Default)]
pub struct NoopLockObserver;

impl LockObserver for NoopLockObserver {}

/// Observer that forwards lock events to the `log` facade.
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl LockObserver for LoggingObserver {
    fn on_requested(&self, resource: &str, id: RequestId, mode: LockMode) {
        trace!("Requested {mode} lock {id} on '{resource}'");
    }

    fn on_queued(&self, resource: &str, id: RequestId, mode: LockMode, position: usize) {
        debug!("Queued {mode} request {id} on '{resource}' at position {position}");
    }

    fn on_granted(&self, resource: &str, id: RequestId, mode: LockMode, waited: Duration) {
        debug!(
            "Granted {mode} lock {id} on '{resource}' after {:.3}s",
            waited.as_secs_f64()
        );
    }

    fn on_released(
        &self,
        resource: &str,
        id: RequestId,
        mode: LockMode,
        reason: ReleaseReason,
        held: Duration,
    ) {
        match reason {
            ReleaseReason::TimedOut => warn!(
                "Lock {id} ({mode}) on '{resource}' timed out after {:.3}s and was released",
                held.as_secs_f64()
            ),
            ReleaseReason::Unlocked | ReleaseReason::Cancelled => debug!(
                "Released {mode} lock {id} on '{resource}' ({reason}) after {:.3}s",
                held.as_secs_f64()
            ),
        }
    }

    fn on_withdrawn(&self, resource: &str, id: RequestId, mode: LockMode) {
        debug!("Cancelled queued {mode} request {id} on '{resource}'");
    }

    fn on_upgrade_requested(&self, resource: &str, id: RequestId, blocking_readers: usize) {
        if blocking_readers > 0 {
            info!(
                "Upgrade of {id} on '{resource}' waiting for {blocking_readers} shared holder(s)"
            );
        }
    }

    fn on_upgraded(&self, resource: &str, id: RequestId) {
        debug!("Upgraded {id} on '{resource}' to exclusive");
    }

    fn on_downgraded(&self, resource: &str, id: RequestId) {
        debug!("Downgraded {id} on '{resource}' to upgradable");
    }
}
