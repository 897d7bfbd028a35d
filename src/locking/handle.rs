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
use crate::locking::manager::{self, Inner};
use crate::locking::mode::LockMode;
use crate::locking::request::{ReleaseReason, RequestId, RequestState, RequestTicket};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

/// Shared core of every grant value.
///
/// The manager is held weakly: grants are often captured by callbacks that
/// sit in the manager's own queue.
#[derive(Clone)]
struct Held {
    inner: Weak<Inner>,
    ticket: Arc<RequestTicket>,
}

impl Held {
    fn new(inner: &Arc<Inner>, ticket: Arc<RequestTicket>) -> Self {
        Self {
            inner: Arc::downgrade(inner),
            ticket,
        }
    }

    fn manager(&self) -> Result<Arc<Inner>> {
        self.inner.upgrade().ok_or_else(|| ResmutexError::LockNotHeld {
            resource: self.ticket.resource().to_string(),
        })
    }

    fn unlock(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.release(&self.ticket, ReleaseReason::Unlocked);
        }
    }

    fn is_held(&self) -> bool {
        self.ticket.state() == RequestState::Granted
    }
}

impl fmt::Debug for Held {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grant")
            .field("id", &self.ticket.id())
            .field("resource", &self.ticket.resource())
            .field("mode", &self.ticket.mode())
            .field("state", &self.ticket.state())
            .finish()
    }
}

/// Exclusive or shared access to a resource.
///
/// Unlocking is idempotent and also a no-op once the lock timed out, the
/// request was cancelled or every [`LockManager`](crate::locking::LockManager)
/// clone has been dropped.
#[derive(Debug, Clone)]
pub struct Grant {
    held: Held,
}

impl Grant {
    pub(crate) fn new(inner: Arc<Inner>, ticket: Arc<RequestTicket>) -> Self {
        Self {
            held: Held::new(&inner, ticket),
        }
    }

    pub fn unlock(&self) {
        self.held.unlock();
    }

    pub fn resource(&self) -> &str {
        self.held.ticket.resource()
    }

    pub fn mode(&self) -> LockMode {
        self.held.ticket.mode()
    }

    pub fn id(&self) -> RequestId {
        self.held.ticket.id()
    }

    /// Whether the lock is still held by this request.
    pub fn is_held(&self) -> bool {
        self.held.is_held()
    }
}

/// Upgradable access: coexists with readers until it is upgraded.
#[derive(Debug, Clone)]
pub struct UpgradableGrant {
    held: Held,
}

impl UpgradableGrant {
    pub(crate) fn new(inner: Arc<Inner>, ticket: Arc<RequestTicket>) -> Self {
        Self {
            held: Held::new(&inner, ticket),
        }
    }

    pub fn unlock(&self) {
        self.held.unlock();
    }

    pub fn resource(&self) -> &str {
        self.held.ticket.resource()
    }

    pub fn id(&self) -> RequestId {
        self.held.ticket.id()
    }

    pub fn is_held(&self) -> bool {
        self.held.is_held()
    }

    /// Requests exclusive access without giving up the lock.
    ///
    /// Readers that hold the resource at the time of the call are waited
    /// out; no new readers are admitted meanwhile. `on_upgraded` is dropped
    /// without firing if the lock is released before the upgrade completes.
    pub fn upgrade<F>(&self, on_upgraded: F) -> Result<()>
    where
        F: FnOnce(UpgradedGrant) + Send + 'static,
    {
        self.held
            .manager()?
            .upgrade(&self.held.ticket, Box::new(on_upgraded))
    }

    /// Waits until the upgrade completes.
    ///
    /// Fails with `RequestAbandoned` if the lock is released first. Dropping
    /// the future does not withdraw the upgrade; unlock to give it up.
    pub async fn upgrade_async(&self) -> Result<UpgradedGrant> {
        let (sender, receiver) = oneshot::channel();
        self.upgrade(manager::hand_over(sender))?;
        receiver
            .await
            .map_err(|_| ResmutexError::RequestAbandoned {
                resource: self.resource().to_string(),
            })
    }
}

/// Exclusive phase of an upgradable lock.
#[derive(Debug, Clone)]
pub struct UpgradedGrant {
    held: Held,
}

impl UpgradedGrant {
    pub(crate) fn new(inner: Arc<Inner>, ticket: Arc<RequestTicket>) -> Self {
        Self {
            held: Held::new(&inner, ticket),
        }
    }

    pub fn unlock(&self) {
        self.held.unlock();
    }

    pub fn resource(&self) -> &str {
        self.held.ticket.resource()
    }

    pub fn id(&self) -> RequestId {
        self.held.ticket.id()
    }

    pub fn is_held(&self) -> bool {
        self.held.is_held()
    }

    /// Returns to upgradable access and lets waiting readers back in.
    ///
    /// `on_downgraded` fires after the readers admitted by the downgrade have
    /// been granted. Calling this again, or after the lock was released, does
    /// nothing.
    pub fn downgrade<F>(&self, on_downgraded: F)
    where
        F: FnOnce(UpgradableGrant) + Send + 'static,
    {
        if let Ok(inner) = self.held.manager() {
            inner.downgrade(&self.held.ticket, Box::new(on_downgraded));
        }
    }

    /// Downgrades and waits for the callback. The downgrade itself happens
    /// on the first poll, so dropping the future afterwards keeps the lock
    /// in the upgradable phase.
    pub async fn downgrade_async(&self) -> Result<UpgradableGrant> {
        let (sender, receiver) = oneshot::channel();
        let downgraded = self
            .held
            .manager()?
            .downgrade(&self.held.ticket, Box::new(manager::hand_over(sender)));
        if !downgraded {
            return Err(ResmutexError::LockNotHeld {
                resource: self.resource().to_string(),
            });
        }
        receiver
            .await
            .map_err(|_| ResmutexError::RequestAbandoned {
                resource: self.resource().to_string(),
            })
    }
}

/// Grant delivered to [`LockManager::acquire`](crate::locking::LockManager::acquire)
/// callbacks, tagged with the mode that was requested.
#[derive(Debug, Clone)]
pub enum AnyGrant {
    Exclusive(Grant),
    Shared(Grant),
    Upgradable(UpgradableGrant),
}

impl AnyGrant {
    pub(crate) fn new(inner: Arc<Inner>, ticket: Arc<RequestTicket>) -> Self {
        match ticket.mode() {
            LockMode::Exclusive => AnyGrant::Exclusive(Grant::new(inner, ticket)),
            LockMode::Shared => AnyGrant::Shared(Grant::new(inner, ticket)),
            LockMode::Upgradable => AnyGrant::Upgradable(UpgradableGrant::new(inner, ticket)),
        }
    }

    fn held(&self) -> &Held {
        match self {
            AnyGrant::Exclusive(grant) | AnyGrant::Shared(grant) => &grant.held,
            AnyGrant::Upgradable(grant) => &grant.held,
        }
    }

    pub fn unlock(&self) {
        self.held().unlock();
    }

    pub fn mode(&self) -> LockMode {
        self.held().ticket.mode()
    }

    pub fn resource(&self) -> &str {
        self.held().ticket.resource()
    }

    pub fn id(&self) -> RequestId {
        self.held().ticket.id()
    }

    pub fn is_held(&self) -> bool {
        self.held().is_held()
    }

    pub fn into_upgradable(self) -> Option<UpgradableGrant> {
        match self {
            AnyGrant::Upgradable(grant) => Some(grant),
            AnyGrant::Exclusive(_) | AnyGrant::Shared(_) => None,
        }
    }
}

/// Returned by every lock request; cancels it at any point of its life.
///
/// A queued request is withdrawn and its callback never fires. A granted
/// request is released, and its callback is suppressed if it has not been
/// delivered yet. Cancelling a finished request does nothing.
#[derive(Clone)]
pub struct CancelHandle {
    manager: Weak<Inner>,
    ticket: Arc<RequestTicket>,
}

impl CancelHandle {
    pub(crate) fn new(manager: Weak<Inner>, ticket: Arc<RequestTicket>) -> Self {
        Self { manager, ticket }
    }

    pub fn cancel(&self) {
        if let Some(inner) = self.manager.upgrade() {
            inner.cancel(&self.ticket);
        }
    }

    pub fn mode(&self) -> LockMode {
        self.ticket.mode()
    }

    pub fn id(&self) -> RequestId {
        self.ticket.id()
    }

    pub fn resource(&self) -> &str {
        self.ticket.resource()
    }

    pub fn state(&self) -> RequestState {
        self.ticket.state()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("id", &self.ticket.id())
            .field("resource", &self.ticket.resource())
            .field("mode", &self.ticket.mode())
            .field("state", &self.ticket.state())
            .finish()
    }
}

/// Cancels the wrapped request when dropped unless disarmed.
pub(crate) struct CancelOnDrop {
    handle: Option<CancelHandle>,
}

impl CancelOnDrop {
    pub(crate) fn new(handle: CancelHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub(crate) fn resource(&self) -> &str {
        self.handle
            .as_ref()
            .map(CancelHandle::resource)
            .unwrap_or_default()
    }

    pub(crate) fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }
}
