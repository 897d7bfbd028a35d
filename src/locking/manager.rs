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

//! Callback-driven lock manager.
//!
//! [`LockManager`] keeps one [`ResourceTable`] behind a mutex. Every public
//! operation mutates the table under that mutex, turns the resulting
//! transitions into callback deliveries on the [`Dispatcher`], and reports
//! observer events once the mutex has been released.

use crate::config::LockingConfig;
use crate::error::{ResmutexError, Result};
use crate::locking::dispatcher::Dispatcher;
use crate::locking::handle::{
    AnyGrant, CancelHandle, CancelOnDrop, Grant, UpgradableGrant, UpgradedGrant,
};
use crate::locking::mode::LockMode;
use crate::locking::observer::{LockObserver, NoopLockObserver};
use crate::locking::request::{ReleaseReason, RequestId, RequestState, RequestTicket};
use crate::locking::table::{
    Admission, ResourceSnapshot, ResourceTable, Transition, UpgradeStatus, Waiter,
};
use crate::locking::timeout::{self, LockTimeoutValue};
use log::{debug, trace};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

pub(crate) type UpgradedCallback = Box<dyn FnOnce(UpgradedGrant) + Send + 'static>;
pub(crate) type DowngradedCallback = Box<dyn FnOnce(UpgradableGrant) + Send + 'static>;

enum GrantCallback {
    Plain(Box<dyn FnOnce(Grant) + Send + 'static>),
    Upgradable(Box<dyn FnOnce(UpgradableGrant) + Send + 'static>),
    Any(Box<dyn FnOnce(AnyGrant) + Send + 'static>),
}

/// Queue payload: everything needed to complete a request once it is granted.
struct Pending {
    ticket: Arc<RequestTicket>,
    callback: GrantCallback,
    timeout: Option<Duration>,
}

struct PendingUpgrade {
    ticket: Arc<RequestTicket>,
    callback: UpgradedCallback,
}

struct ManagerState {
    table: ResourceTable<Pending>,
    upgrades: HashMap<RequestId, PendingUpgrade>,
}

/// Observer events buffered while the table is locked.
enum Notice {
    Requested(Arc<RequestTicket>),
    Queued(Arc<RequestTicket>, usize),
    Granted(Arc<RequestTicket>, Duration),
    Released(Arc<RequestTicket>, ReleaseReason, Duration),
    Withdrawn(Arc<RequestTicket>),
    UpgradeRequested(Arc<RequestTicket>, usize),
    Upgraded(Arc<RequestTicket>),
    Downgraded(Arc<RequestTicket>),
}

pub(crate) struct Inner {
    state: Mutex<ManagerState>,
    dispatcher: Dispatcher,
    observer: Arc<dyn LockObserver>,
    runtime: Handle,
    default_timeout: LockTimeoutValue,
    next_id: AtomicU64,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(
        self: &Arc<Self>,
        resource: String,
        mode: LockMode,
        callback: GrantCallback,
        timeout: Option<Duration>,
    ) -> CancelHandle {
        let id = RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let ticket = Arc::new(RequestTicket::new(id, mode, Arc::from(resource)));
        let timeout = timeout
            .map(LockTimeoutValue::Finite)
            .unwrap_or(self.default_timeout)
            .as_option();
        let pending = Pending {
            ticket: ticket.clone(),
            callback,
            timeout,
        };

        let mut notices = vec![Notice::Requested(ticket.clone())];
        {
            let mut state = self.lock_state();
            match state
                .table
                .acquire(ticket.resource(), Waiter::new(id, mode, pending))
            {
                Admission::Granted(waiter) => self.grant(waiter, &mut notices),
                Admission::Queued { position } => {
                    notices.push(Notice::Queued(ticket.clone(), position));
                }
            }
        }
        self.notify(notices);

        CancelHandle::new(Arc::downgrade(self), ticket)
    }

    /// Marks a waiter as granted, arms its timer and schedules its callback.
    ///
    /// Must be called with the state mutex held so deliveries keep table order.
    fn grant(self: &Arc<Self>, waiter: Waiter<Pending>, notices: &mut Vec<Notice>) {
        let Pending {
            ticket,
            callback,
            timeout,
        } = waiter.payload;
        let Some(waited) = ticket.mark_granted() else {
            debug!(
                "Ignoring grant of {} on '{}': request is {:?}",
                ticket.id(),
                ticket.resource(),
                ticket.state()
            );
            return;
        };

        if let Some(after) = timeout {
            let manager = Arc::downgrade(self);
            let expiring = ticket.clone();
            let expiry = timeout::spawn_expiry(&self.runtime, after, move || {
                if let Some(inner) = manager.upgrade() {
                    inner.release(&expiring, ReleaseReason::TimedOut);
                }
            });
            ticket.attach_expiry(expiry);
        }

        notices.push(Notice::Granted(ticket.clone(), waited));

        let inner = self.clone();
        self.dispatcher.post(move || {
            if ticket.state() == RequestState::Cancelled {
                trace!(
                    "Skipping grant callback of cancelled request {} on '{}'",
                    ticket.id(),
                    ticket.resource()
                );
                return;
            }
            match callback {
                GrantCallback::Plain(callback) => callback(Grant::new(inner, ticket)),
                GrantCallback::Upgradable(callback) => {
                    callback(UpgradableGrant::new(inner, ticket))
                }
                GrantCallback::Any(callback) => callback(AnyGrant::new(inner, ticket)),
            }
        });
    }

    fn deliver_upgraded(
        self: &Arc<Self>,
        ticket: Arc<RequestTicket>,
        callback: UpgradedCallback,
        notices: &mut Vec<Notice>,
    ) {
        notices.push(Notice::Upgraded(ticket.clone()));

        let inner = self.clone();
        self.dispatcher.post(move || {
            if ticket.state() == RequestState::Cancelled {
                trace!(
                    "Skipping upgrade callback of cancelled request {} on '{}'",
                    ticket.id(),
                    ticket.resource()
                );
                return;
            }
            callback(UpgradedGrant::new(inner, ticket));
        });
    }

    fn apply(
        self: &Arc<Self>,
        state: &mut ManagerState,
        transitions: Vec<Transition<Pending>>,
        notices: &mut Vec<Notice>,
    ) {
        for transition in transitions {
            match transition {
                Transition::Granted(waiter) => self.grant(waiter, notices),
                Transition::Upgraded(holder) => {
                    if let Some(upgrade) = state.upgrades.remove(&holder) {
                        self.deliver_upgraded(upgrade.ticket, upgrade.callback, notices);
                    }
                }
            }
        }
    }

    /// Releases a granted request. Returns `false` when it was not held.
    pub(crate) fn release(
        self: &Arc<Self>,
        ticket: &Arc<RequestTicket>,
        reason: ReleaseReason,
    ) -> bool {
        let mut notices = Vec::new();
        let released = {
            let mut state = self.lock_state();
            self.release_locked(&mut state, ticket, reason, &mut notices)
        };
        self.notify(notices);
        released
    }

    fn release_locked(
        self: &Arc<Self>,
        state: &mut ManagerState,
        ticket: &Arc<RequestTicket>,
        reason: ReleaseReason,
        notices: &mut Vec<Notice>,
    ) -> bool {
        let Some(held) = ticket.mark_released(reason) else {
            return false;
        };
        state.upgrades.remove(&ticket.id());
        notices.push(Notice::Released(ticket.clone(), reason, held));

        if let Some(transitions) = state.table.release(ticket.resource(), ticket.id()) {
            self.apply(state, transitions, notices);
        }
        true
    }

    /// Cancels a request wherever it is in its lifecycle.
    pub(crate) fn cancel(self: &Arc<Self>, ticket: &Arc<RequestTicket>) {
        let mut notices = Vec::new();
        let withdrawn = {
            let mut state = self.lock_state();
            match ticket.state() {
                RequestState::Queued => {
                    match state.table.withdraw(ticket.resource(), ticket.id()) {
                        Some((waiter, transitions)) => {
                            ticket.mark_withdrawn();
                            notices.push(Notice::Withdrawn(ticket.clone()));
                            self.apply(&mut state, transitions, &mut notices);
                            Some(waiter)
                        }
                        None => None,
                    }
                }
                RequestState::Granted => {
                    self.release_locked(
                        &mut state,
                        ticket,
                        ReleaseReason::Cancelled,
                        &mut notices,
                    );
                    None
                }
                RequestState::Released | RequestState::Cancelled => None,
            }
        };
        // The withdrawn callback is dropped here, outside the state mutex.
        drop(withdrawn);
        self.notify(notices);
    }

    pub(crate) fn upgrade(
        self: &Arc<Self>,
        ticket: &Arc<RequestTicket>,
        callback: UpgradedCallback,
    ) -> Result<()> {
        let mut notices = Vec::new();
        {
            let mut state = self.lock_state();
            if ticket.state() != RequestState::Granted {
                return Err(ResmutexError::LockNotHeld {
                    resource: ticket.resource().to_string(),
                });
            }

            match state.table.upgrade(ticket.resource(), ticket.id())? {
                UpgradeStatus::Immediate => {
                    notices.push(Notice::UpgradeRequested(ticket.clone(), 0));
                    self.deliver_upgraded(ticket.clone(), callback, &mut notices);
                }
                UpgradeStatus::Pending { readers } => {
                    notices.push(Notice::UpgradeRequested(ticket.clone(), readers));
                    state.upgrades.insert(
                        ticket.id(),
                        PendingUpgrade {
                            ticket: ticket.clone(),
                            callback,
                        },
                    );
                }
            }
        }
        self.notify(notices);
        Ok(())
    }

    /// Downgrades an upgraded holder. Returns `false` (dropping `callback`)
    /// when the request is not currently upgraded.
    pub(crate) fn downgrade(
        self: &Arc<Self>,
        ticket: &Arc<RequestTicket>,
        callback: DowngradedCallback,
    ) -> bool {
        let mut notices = Vec::new();
        {
            let mut state = self.lock_state();
            if ticket.state() != RequestState::Granted {
                return false;
            }
            let Some(transitions) = state.table.downgrade(ticket.resource(), ticket.id()) else {
                return false;
            };

            notices.push(Notice::Downgraded(ticket.clone()));
            self.apply(&mut state, transitions, &mut notices);

            let inner = self.clone();
            let ticket = ticket.clone();
            self.dispatcher.post(move || {
                if ticket.state() == RequestState::Cancelled {
                    return;
                }
                callback(UpgradableGrant::new(inner, ticket));
            });
        }
        self.notify(notices);
        true
    }

    fn notify(&self, notices: Vec<Notice>) {
        let observer = self.observer.as_ref();
        for notice in notices {
            match notice {
                Notice::Requested(ticket) => {
                    observer.on_requested(ticket.resource(), ticket.id(), ticket.mode())
                }
                Notice::Queued(ticket, position) => observer.on_queued(
                    ticket.resource(),
                    ticket.id(),
                    ticket.mode(),
                    position,
                ),
                Notice::Granted(ticket, waited) => {
                    observer.on_granted(ticket.resource(), ticket.id(), ticket.mode(), waited)
                }
                Notice::Released(ticket, reason, held) => observer.on_released(
                    ticket.resource(),
                    ticket.id(),
                    ticket.mode(),
                    reason,
                    held,
                ),
                Notice::Withdrawn(ticket) => {
                    observer.on_withdrawn(ticket.resource(), ticket.id(), ticket.mode())
                }
                Notice::UpgradeRequested(ticket, readers) => {
                    observer.on_upgrade_requested(ticket.resource(), ticket.id(), readers)
                }
                Notice::Upgraded(ticket) => observer.on_upgraded(ticket.resource(), ticket.id()),
                Notice::Downgraded(ticket) => {
                    observer.on_downgraded(ticket.resource(), ticket.id())
                }
            }
        }
    }
}

/// Grants exclusive, shared and upgradable locks on named resources.
///
/// Cloning is cheap; clones share the same resource table. Callbacks run one
/// at a time on a dispatcher task owned by the manager, never inside the call
/// that caused them, so they must not block.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("default_timeout", &self.inner.default_timeout)
            .field("resources", &self.active_resources())
            .finish()
    }
}

impl LockManager {
    /// Creates a manager with no default timeout on the current tokio runtime.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> LockManagerBuilder {
        LockManagerBuilder::default()
    }

    pub fn from_config(config: &LockingConfig) -> Result<Self> {
        Self::builder()
            .default_timeout(config.default_timeout_value()?)
            .build()
    }

    pub fn default_timeout(&self) -> LockTimeoutValue {
        self.inner.default_timeout
    }

    /// Requests exclusive access to `resource`.
    ///
    /// `timeout` bounds how long the lock stays held once granted; `None`
    /// falls back to the manager's default timeout and a zero duration arms
    /// no timer.
    pub fn exclusive<F>(
        &self,
        resource: impl Into<String>,
        on_granted: F,
        timeout: Option<Duration>,
    ) -> CancelHandle
    where
        F: FnOnce(Grant) + Send + 'static,
    {
        self.inner.request(
            resource.into(),
            LockMode::Exclusive,
            GrantCallback::Plain(Box::new(on_granted)),
            timeout,
        )
    }

    /// Requests shared access to `resource`.
    pub fn shared<F>(
        &self,
        resource: impl Into<String>,
        on_granted: F,
        timeout: Option<Duration>,
    ) -> CancelHandle
    where
        F: FnOnce(Grant) + Send + 'static,
    {
        self.inner.request(
            resource.into(),
            LockMode::Shared,
            GrantCallback::Plain(Box::new(on_granted)),
            timeout,
        )
    }

    /// Requests upgradable access: shared with readers, exclusive against
    /// writers and other upgradable holders, and promotable via
    /// [`UpgradableGrant::upgrade`].
    pub fn upgradable<F>(
        &self,
        resource: impl Into<String>,
        on_granted: F,
        timeout: Option<Duration>,
    ) -> CancelHandle
    where
        F: FnOnce(UpgradableGrant) + Send + 'static,
    {
        self.inner.request(
            resource.into(),
            LockMode::Upgradable,
            GrantCallback::Upgradable(Box::new(on_granted)),
            timeout,
        )
    }

    /// Requests `resource` in a mode chosen at runtime.
    pub fn acquire<F>(
        &self,
        resource: impl Into<String>,
        mode: LockMode,
        on_granted: F,
        timeout: Option<Duration>,
    ) -> CancelHandle
    where
        F: FnOnce(AnyGrant) + Send + 'static,
    {
        self.inner.request(
            resource.into(),
            mode,
            GrantCallback::Any(Box::new(on_granted)),
            timeout,
        )
    }

    /// Waits for exclusive access. Dropping the future cancels the request.
    pub async fn lock_exclusive(
        &self,
        resource: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Grant> {
        let (sender, receiver) = oneshot::channel();
        let handle = self.exclusive(resource, forward(sender, Grant::unlock), timeout);
        wait_for(handle, receiver).await
    }

    /// Waits for shared access. Dropping the future cancels the request.
    pub async fn lock_shared(
        &self,
        resource: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Grant> {
        let (sender, receiver) = oneshot::channel();
        let handle = self.shared(resource, forward(sender, Grant::unlock), timeout);
        wait_for(handle, receiver).await
    }

    /// Waits for upgradable access. Dropping the future cancels the request.
    pub async fn lock_upgradable(
        &self,
        resource: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<UpgradableGrant> {
        let (sender, receiver) = oneshot::channel();
        let handle = self.upgradable(resource, forward(sender, UpgradableGrant::unlock), timeout);
        wait_for(handle, receiver).await
    }

    /// Current holders and queue length of `resource`, or `None` when it is idle.
    pub fn snapshot(&self, resource: &str) -> Option<ResourceSnapshot> {
        self.inner.lock_state().table.snapshot(resource)
    }

    /// Number of resources that are held or have waiters.
    pub fn active_resources(&self) -> usize {
        self.inner.lock_state().table.len()
    }
}

/// Builds a callback that hands the grant to an awaiting future, or releases
/// it straight away when that future is gone.
pub(crate) fn forward<G>(
    sender: oneshot::Sender<G>,
    release: fn(&G),
) -> impl FnOnce(G) + Send + 'static
where
    G: Send + 'static,
{
    move |grant| {
        if let Err(grant) = sender.send(grant) {
            release(&grant);
        }
    }
}

/// Builds a callback that hands an upgrade or downgrade to an awaiting
/// future. When that future is gone the value is dropped and the lock stays
/// with its holder.
pub(crate) fn hand_over<G>(sender: oneshot::Sender<G>) -> impl FnOnce(G) + Send + 'static
where
    G: Send + 'static,
{
    move |grant| {
        let _ = sender.send(grant);
    }
}

/// Awaits a forwarded grant, cancelling the request if the future is dropped.
pub(crate) async fn wait_for<G>(
    handle: CancelHandle,
    receiver: oneshot::Receiver<G>,
) -> Result<G> {
    let guard = CancelOnDrop::new(handle);
    match receiver.await {
        Ok(grant) => {
            guard.disarm();
            Ok(grant)
        }
        Err(_) => Err(ResmutexError::RequestAbandoned {
            resource: guard.resource().to_string(),
        }),
    }
}

/// Builder for [`LockManager`].
#[derive(Default)]
pub struct LockManagerBuilder {
    default_timeout: LockTimeoutValue,
    observer: Option<Arc<dyn LockObserver>>,
    runtime: Option<Handle>,
}

impl LockManagerBuilder {
    /// Hold budget applied when a request passes no timeout of its own.
    pub fn default_timeout(mut self, timeout: LockTimeoutValue) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn LockObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Runtime for the dispatcher and timers. Defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<LockManager> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| ResmutexError::NoRuntime)?,
        };
        debug!(
            "Starting lock manager with default timeout {}",
            self.default_timeout
        );

        Ok(LockManager {
            inner: Arc::new(Inner {
                state: Mutex::new(ManagerState {
                    table: ResourceTable::new(),
                    upgrades: HashMap::new(),
                }),
                dispatcher: Dispatcher::spawn(&runtime),
                observer: self
                    .observer
                    .unwrap_or_else(|| Arc::new(NoopLockObserver)),
                runtime,
                default_timeout: self.default_timeout,
                next_id: AtomicU64::new(0),
            }),
        })
    }
}
