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

//! Resource table: holder bookkeeping and queue scheduling.
//!
//! The table is a synchronous state machine. It never runs callbacks, starts
//! timers or sleeps; every operation returns the [`Transition`]s it produced
//! and the manager turns those into deferred deliveries.

use crate::error::{ResmutexError, Result};
use crate::locking::mode::{HolderMode, LockMode};
use crate::locking::request::RequestId;
use log::trace;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::mem;

/// Progress of an upgradable holder towards exclusive access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpgradePhase {
    /// Coexists with shared holders.
    Idle,
    /// Waiting for the shared holders present at upgrade time to leave.
    Pending,
    /// Holding the resource exclusively.
    Upgraded,
}

/// Current holders of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Holders {
    Empty,
    Exclusive(RequestId),
    Shared(BTreeSet<RequestId>),
    Upgradable {
        holder: RequestId,
        readers: BTreeSet<RequestId>,
        phase: UpgradePhase,
    },
}

/// Outcome of removing a holder.
#[derive(Debug, PartialEq, Eq)]
enum Removal {
    NotHeld,
    Released,
    /// The last reader blocking a pending upgrade left.
    UpgradeReady(RequestId),
}

impl Holders {
    pub(crate) fn mode(&self) -> HolderMode {
        match self {
            Holders::Empty => HolderMode::None,
            Holders::Exclusive(_) => HolderMode::Exclusive,
            Holders::Shared(_) => HolderMode::Shared,
            Holders::Upgradable { phase, .. } => match phase {
                UpgradePhase::Upgraded => HolderMode::Exclusive,
                UpgradePhase::Idle | UpgradePhase::Pending => HolderMode::Upgradable,
            },
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Holders::Empty => 0,
            Holders::Exclusive(_) => 1,
            Holders::Shared(readers) => readers.len(),
            Holders::Upgradable { readers, .. } => readers.len() + 1,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Holders::Empty)
    }

    /// Whether a request for `mode` may join the current holders.
    pub(crate) fn admits(&self, mode: LockMode) -> bool {
        match (self, mode) {
            (Holders::Empty, _) => true,
            (Holders::Exclusive(_), _) => false,
            (Holders::Shared(_), LockMode::Exclusive) => false,
            (Holders::Shared(_), LockMode::Shared | LockMode::Upgradable) => true,
            (
                Holders::Upgradable {
                    phase: UpgradePhase::Idle,
                    ..
                },
                LockMode::Shared,
            ) => true,
            (Holders::Upgradable { .. }, _) => false,
        }
    }

    fn admit(&mut self, id: RequestId, mode: LockMode) {
        debug_assert!(self.admits(mode), "admitted {mode} over {self:?}");
        *self = match (mem::replace(self, Holders::Empty), mode) {
            (Holders::Empty, LockMode::Exclusive) => Holders::Exclusive(id),
            (Holders::Empty, LockMode::Shared) => Holders::Shared(BTreeSet::from([id])),
            (Holders::Empty, LockMode::Upgradable) => Holders::Upgradable {
                holder: id,
                readers: BTreeSet::new(),
                phase: UpgradePhase::Idle,
            },
            (Holders::Shared(mut readers), LockMode::Shared) => {
                readers.insert(id);
                Holders::Shared(readers)
            }
            (Holders::Shared(readers), LockMode::Upgradable) => Holders::Upgradable {
                holder: id,
                readers,
                phase: UpgradePhase::Idle,
            },
            (
                Holders::Upgradable {
                    holder,
                    mut readers,
                    phase,
                },
                LockMode::Shared,
            ) => {
                readers.insert(id);
                Holders::Upgradable {
                    holder,
                    readers,
                    phase,
                }
            }
            (holders, _) => holders,
        };
    }

    fn remove(&mut self, id: RequestId) -> Removal {
        match self {
            Holders::Empty => Removal::NotHeld,
            Holders::Exclusive(holder) => {
                if *holder != id {
                    return Removal::NotHeld;
                }
                *self = Holders::Empty;
                Removal::Released
            }
            Holders::Shared(readers) => {
                if !readers.remove(&id) {
                    return Removal::NotHeld;
                }
                if readers.is_empty() {
                    *self = Holders::Empty;
                }
                Removal::Released
            }
            Holders::Upgradable {
                holder,
                readers,
                phase,
            } => {
                if *holder == id {
                    let readers = mem::take(readers);
                    *self = if readers.is_empty() {
                        Holders::Empty
                    } else {
                        Holders::Shared(readers)
                    };
                    return Removal::Released;
                }
                if !readers.remove(&id) {
                    return Removal::NotHeld;
                }
                if *phase == UpgradePhase::Pending && readers.is_empty() {
                    *phase = UpgradePhase::Upgraded;
                    return Removal::UpgradeReady(*holder);
                }
                Removal::Released
            }
        }
    }
}

/// A request waiting in a resource queue.
#[derive(Debug)]
pub(crate) struct Waiter<P> {
    pub id: RequestId,
    pub mode: LockMode,
    pub payload: P,
}

impl<P> Waiter<P> {
    pub(crate) fn new(id: RequestId, mode: LockMode, payload: P) -> Self {
        Self { id, mode, payload }
    }
}

/// State change the manager has to act on.
#[derive(Debug)]
pub(crate) enum Transition<P> {
    /// The waiter now holds the resource.
    Granted(Waiter<P>),
    /// The pending upgrade of this holder completed.
    Upgraded(RequestId),
}

/// Result of submitting a request.
#[derive(Debug)]
pub(crate) enum Admission<P> {
    Granted(Waiter<P>),
    Queued { position: usize },
}

/// Whether an upgrade completed on the spot or has to wait for readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpgradeStatus {
    Immediate,
    Pending { readers: usize },
}

/// Point-in-time view of a resource, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSnapshot {
    pub holder_mode: HolderMode,
    pub holders: usize,
    pub queued: usize,
    pub upgrade: Option<UpgradePhase>,
}

#[derive(Debug)]
struct ResourceState<P> {
    holders: Holders,
    queue: VecDeque<Waiter<P>>,
}

impl<P> ResourceState<P> {
    fn new() -> Self {
        Self {
            holders: Holders::Empty,
            queue: VecDeque::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }

    /// Hands an unlocked resource to the queue head.
    ///
    /// A granted Shared head brings the contiguous run of Shared waiters
    /// behind it along; any other mode is granted alone. Nothing happens
    /// while the resource still has holders.
    fn drain(&mut self, transitions: &mut Vec<Transition<P>>) {
        if !self.holders.is_empty() {
            return;
        }
        let Some(head) = self.queue.pop_front() else {
            return;
        };
        let batch = head.mode == LockMode::Shared;
        self.holders.admit(head.id, head.mode);
        transitions.push(Transition::Granted(head));

        if batch {
            self.admit_shared_run(transitions);
        }
    }

    /// Grants the Shared waiters at the front of the queue, stopping at the
    /// first waiter of another mode.
    fn admit_shared_run(&mut self, transitions: &mut Vec<Transition<P>>) {
        while let Some(head) = self.queue.front() {
            if head.mode != LockMode::Shared || !self.holders.admits(LockMode::Shared) {
                break;
            }
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            self.holders.admit(waiter.id, waiter.mode);
            transitions.push(Transition::Granted(waiter));
        }
    }
}

/// Maps resource names to their holders and queues.
#[derive(Debug)]
pub(crate) struct ResourceTable<P> {
    resources: HashMap<String, ResourceState<P>>,
}

impl<P> Default for ResourceTable<P> {
    fn default() -> Self {
        Self {
            resources: HashMap::new(),
        }
    }
}

impl<P> ResourceTable<P> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.resources.len()
    }

    pub(crate) fn snapshot(&self, name: &str) -> Option<ResourceSnapshot> {
        self.resources.get(name).map(|state| ResourceSnapshot {
            holder_mode: state.holders.mode(),
            holders: state.holders.len(),
            queued: state.queue.len(),
            upgrade: match &state.holders {
                Holders::Upgradable { phase, .. } => Some(*phase),
                _ => None,
            },
        })
    }

    /// Grants the request when nothing is queued ahead of it and its mode is
    /// compatible with the holders; otherwise appends it to the queue.
    pub(crate) fn acquire(&mut self, name: &str, waiter: Waiter<P>) -> Admission<P> {
        let state = self
            .resources
            .entry(name.to_string())
            .or_insert_with(ResourceState::new);

        if state.queue.is_empty() && state.holders.admits(waiter.mode) {
            state.holders.admit(waiter.id, waiter.mode);
            return Admission::Granted(waiter);
        }

        state.queue.push_back(waiter);
        Admission::Queued {
            position: state.queue.len(),
        }
    }

    /// Removes a holder and drains the queue once the resource is unlocked.
    ///
    /// Returns `None` when `id` does not hold `name`, which makes repeated
    /// releases harmless.
    pub(crate) fn release(&mut self, name: &str, id: RequestId) -> Option<Vec<Transition<P>>> {
        let state = self.resources.get_mut(name)?;
        let mut transitions = Vec::new();

        match state.holders.remove(id) {
            Removal::NotHeld => return None,
            Removal::Released => {}
            Removal::UpgradeReady(holder) => transitions.push(Transition::Upgraded(holder)),
        }

        state.drain(&mut transitions);
        trace!(
            "Released {id} on {name}: {} transition(s), {} still queued",
            transitions.len(),
            state.queue.len()
        );
        self.prune(name);
        Some(transitions)
    }

    /// Withdraws a request that is still queued.
    ///
    /// Waiters behind it keep their place until the resource is unlocked.
    pub(crate) fn withdraw(
        &mut self,
        name: &str,
        id: RequestId,
    ) -> Option<(Waiter<P>, Vec<Transition<P>>)> {
        let state = self.resources.get_mut(name)?;
        let index = state.queue.iter().position(|waiter| waiter.id == id)?;
        let waiter = state.queue.remove(index)?;

        let mut transitions = Vec::new();
        if index == 0 {
            state.drain(&mut transitions);
        }
        self.prune(name);
        Some((waiter, transitions))
    }

    /// Starts promoting the upgradable holder `id` to exclusive access.
    pub(crate) fn upgrade(&mut self, name: &str, id: RequestId) -> Result<UpgradeStatus> {
        let not_held = || ResmutexError::LockNotHeld {
            resource: name.to_string(),
        };
        let state = self.resources.get_mut(name).ok_or_else(not_held)?;

        match &mut state.holders {
            Holders::Upgradable {
                holder,
                readers,
                phase,
            } if *holder == id => match *phase {
                UpgradePhase::Idle if readers.is_empty() => {
                    *phase = UpgradePhase::Upgraded;
                    Ok(UpgradeStatus::Immediate)
                }
                UpgradePhase::Idle => {
                    *phase = UpgradePhase::Pending;
                    Ok(UpgradeStatus::Pending {
                        readers: readers.len(),
                    })
                }
                UpgradePhase::Pending | UpgradePhase::Upgraded => {
                    Err(ResmutexError::UpgradeInProgress {
                        resource: name.to_string(),
                    })
                }
            },
            _ => Err(not_held()),
        }
    }

    /// Returns an upgraded holder to the upgradable phase and admits the
    /// shared waiters that queued meanwhile.
    ///
    /// Returns `None` when `id` is not currently upgraded.
    pub(crate) fn downgrade(&mut self, name: &str, id: RequestId) -> Option<Vec<Transition<P>>> {
        let state = self.resources.get_mut(name)?;
        match &mut state.holders {
            Holders::Upgradable { holder, phase, .. }
                if *holder == id && *phase == UpgradePhase::Upgraded =>
            {
                *phase = UpgradePhase::Idle;
            }
            _ => return None,
        }

        let mut transitions = Vec::new();
        state.admit_shared_run(&mut transitions);
        Some(transitions)
    }

    fn prune(&mut self, name: &str) {
        if self
            .resources
            .get(name)
            .is_some_and(|state| state.is_idle())
        {
            self.resources.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> RequestId {
        RequestId::new(raw)
    }

    fn request(table: &mut ResourceTable<&'static str>, raw: u64, mode: LockMode) -> bool {
        let label = match mode {
            LockMode::Exclusive => "exclusive",
            LockMode::Shared => "shared",
            LockMode::Upgradable => "upgradable",
        };
        matches!(
            table.acquire("r", Waiter::new(id(raw), mode, label)),
            Admission::Granted(_)
        )
    }

    fn granted(transitions: &[Transition<&'static str>]) -> Vec<u64> {
        transitions
            .iter()
            .filter_map(|transition| match transition {
                Transition::Granted(waiter) => Some(waiter.id.get()),
                Transition::Upgraded(_) => None,
            })
            .collect()
    }

    #[test]
    fn exclusive_requests_are_granted_in_arrival_order() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Exclusive));
        assert!(!request(&mut table, 2, LockMode::Exclusive));
        assert!(!request(&mut table, 3, LockMode::Exclusive));

        assert_eq!(granted(&table.release("r", id(1)).unwrap()), vec![2]);
        assert_eq!(granted(&table.release("r", id(2)).unwrap()), vec![3]);
        assert!(granted(&table.release("r", id(3)).unwrap()).is_empty());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn consecutive_shared_waiters_wake_together() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Exclusive));
        for raw in 2..=4 {
            assert!(!request(&mut table, raw, LockMode::Shared));
        }
        assert!(!request(&mut table, 5, LockMode::Exclusive));
        assert!(!request(&mut table, 6, LockMode::Shared));

        assert_eq!(granted(&table.release("r", id(1)).unwrap()), vec![2, 3, 4]);
        let snapshot = table.snapshot("r").unwrap();
        assert_eq!(snapshot.holder_mode, HolderMode::Shared);
        assert_eq!(snapshot.holders, 3);
        assert_eq!(snapshot.queued, 2);
    }

    #[test]
    fn queued_exclusive_blocks_later_shared_requests() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Shared));
        assert!(!request(&mut table, 2, LockMode::Exclusive));
        assert!(!request(&mut table, 3, LockMode::Shared));

        assert_eq!(granted(&table.release("r", id(1)).unwrap()), vec![2]);
        assert_eq!(granted(&table.release("r", id(2)).unwrap()), vec![3]);
    }

    #[test]
    fn shared_release_with_remaining_readers_grants_nothing() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Shared));
        assert!(request(&mut table, 2, LockMode::Shared));
        assert!(!request(&mut table, 3, LockMode::Exclusive));

        assert!(granted(&table.release("r", id(1)).unwrap()).is_empty());
        assert_eq!(granted(&table.release("r", id(2)).unwrap()), vec![3]);
    }

    #[test]
    fn repeated_release_is_ignored() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Shared));
        assert!(request(&mut table, 2, LockMode::Shared));

        assert!(table.release("r", id(1)).is_some());
        assert!(table.release("r", id(1)).is_none());
        assert_eq!(table.snapshot("r").unwrap().holders, 1);
    }

    #[test]
    fn upgradable_coexists_with_shared_but_not_another_upgradable() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Shared));
        assert!(request(&mut table, 2, LockMode::Upgradable));
        assert!(request(&mut table, 3, LockMode::Shared));
        assert!(!request(&mut table, 4, LockMode::Upgradable));

        let snapshot = table.snapshot("r").unwrap();
        assert_eq!(snapshot.holder_mode, HolderMode::Upgradable);
        assert_eq!(snapshot.holders, 3);
        assert_eq!(snapshot.upgrade, Some(UpgradePhase::Idle));

        // The upgradable holder leaves; its readers keep the resource shared
        // and the next upgradable waiter stays queued until they are gone.
        assert!(granted(&table.release("r", id(2)).unwrap()).is_empty());
        assert_eq!(table.snapshot("r").unwrap().holder_mode, HolderMode::Shared);
        assert!(granted(&table.release("r", id(1)).unwrap()).is_empty());
        assert_eq!(granted(&table.release("r", id(3)).unwrap()), vec![4]);
        assert_eq!(table.snapshot("r").unwrap().holders, 1);
    }

    #[test]
    fn shared_run_stops_at_queued_upgradable() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Exclusive));
        assert!(!request(&mut table, 2, LockMode::Shared));
        assert!(!request(&mut table, 3, LockMode::Shared));
        assert!(!request(&mut table, 4, LockMode::Upgradable));

        assert_eq!(granted(&table.release("r", id(1)).unwrap()), vec![2, 3]);
        let snapshot = table.snapshot("r").unwrap();
        assert_eq!(snapshot.holder_mode, HolderMode::Shared);
        assert_eq!(snapshot.holders, 2);
        assert_eq!(snapshot.queued, 1);
    }

    #[test]
    fn upgradable_head_is_granted_alone() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Exclusive));
        assert!(!request(&mut table, 2, LockMode::Upgradable));
        assert!(!request(&mut table, 3, LockMode::Shared));
        assert!(!request(&mut table, 4, LockMode::Shared));

        assert_eq!(granted(&table.release("r", id(1)).unwrap()), vec![2]);
        let snapshot = table.snapshot("r").unwrap();
        assert_eq!(snapshot.holder_mode, HolderMode::Upgradable);
        assert_eq!(snapshot.holders, 1);
        assert_eq!(snapshot.queued, 2);
    }

    #[test]
    fn upgrade_waits_for_existing_readers_only() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Upgradable));
        assert!(request(&mut table, 2, LockMode::Shared));
        assert!(request(&mut table, 3, LockMode::Shared));

        assert_eq!(
            table.upgrade("r", id(1)).unwrap(),
            UpgradeStatus::Pending { readers: 2 }
        );
        // Arrives after the upgrade call: must queue.
        assert!(!request(&mut table, 4, LockMode::Shared));

        assert!(table.release("r", id(2)).unwrap().is_empty());
        let transitions = table.release("r", id(3)).unwrap();
        assert!(matches!(
            transitions.as_slice(),
            [Transition::Upgraded(holder)] if *holder == id(1)
        ));
        let snapshot = table.snapshot("r").unwrap();
        assert_eq!(snapshot.holder_mode, HolderMode::Exclusive);
        assert_eq!(snapshot.upgrade, Some(UpgradePhase::Upgraded));
        assert_eq!(snapshot.queued, 1);
    }

    #[test]
    fn upgrade_without_readers_is_immediate() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Upgradable));
        assert_eq!(
            table.upgrade("r", id(1)).unwrap(),
            UpgradeStatus::Immediate
        );
        assert!(matches!(
            table.upgrade("r", id(1)),
            Err(ResmutexError::UpgradeInProgress { .. })
        ));
    }

    #[test]
    fn upgrade_requires_the_upgradable_holder() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Shared));
        assert!(matches!(
            table.upgrade("r", id(1)),
            Err(ResmutexError::LockNotHeld { .. })
        ));
        assert!(matches!(
            table.upgrade("missing", id(1)),
            Err(ResmutexError::LockNotHeld { .. })
        ));
    }

    #[test]
    fn downgrade_admits_shared_waiters_in_one_batch() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Upgradable));
        table.upgrade("r", id(1)).unwrap();
        for raw in 2..=4 {
            assert!(!request(&mut table, raw, LockMode::Shared));
        }
        assert!(!request(&mut table, 5, LockMode::Exclusive));
        assert!(!request(&mut table, 6, LockMode::Shared));

        let transitions = table.downgrade("r", id(1)).unwrap();
        assert_eq!(granted(&transitions), vec![2, 3, 4]);
        assert_eq!(table.snapshot("r").unwrap().upgrade, Some(UpgradePhase::Idle));

        assert!(table.downgrade("r", id(1)).is_none());
    }

    #[test]
    fn releasing_pending_upgrader_leaves_readers() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Upgradable));
        assert!(request(&mut table, 2, LockMode::Shared));
        table.upgrade("r", id(1)).unwrap();
        assert!(!request(&mut table, 3, LockMode::Shared));

        // The remaining reader keeps the resource; the queue waits for it.
        assert!(granted(&table.release("r", id(1)).unwrap()).is_empty());
        let snapshot = table.snapshot("r").unwrap();
        assert_eq!(snapshot.holder_mode, HolderMode::Shared);
        assert_eq!(snapshot.holders, 1);
        assert_eq!(snapshot.queued, 1);

        assert_eq!(granted(&table.release("r", id(2)).unwrap()), vec![3]);
    }

    #[test]
    fn withdrawing_queue_head_keeps_waiters_queued_while_held() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Shared));
        assert!(!request(&mut table, 2, LockMode::Exclusive));
        assert!(!request(&mut table, 3, LockMode::Shared));

        let (waiter, transitions) = table.withdraw("r", id(2)).unwrap();
        assert_eq!(waiter.payload, "exclusive");
        assert!(transitions.is_empty());
        assert!(table.withdraw("r", id(2)).is_none());

        assert_eq!(granted(&table.release("r", id(1)).unwrap()), vec![3]);
    }

    #[test]
    fn withdrawing_behind_the_head_grants_nothing() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Exclusive));
        assert!(!request(&mut table, 2, LockMode::Shared));
        assert!(!request(&mut table, 3, LockMode::Shared));

        let (_, transitions) = table.withdraw("r", id(3)).unwrap();
        assert!(transitions.is_empty());
        assert_eq!(granted(&table.release("r", id(1)).unwrap()), vec![2]);
    }

    #[test]
    fn idle_resources_are_pruned() {
        let mut table = ResourceTable::new();
        assert!(request(&mut table, 1, LockMode::Exclusive));
        assert!(!request(&mut table, 2, LockMode::Exclusive));
        table.withdraw("r", id(2)).unwrap();
        assert!(table.snapshot("r").is_some());
        table.release("r", id(1)).unwrap();
        assert!(table.snapshot("r").is_none());
        assert_eq!(table.len(), 0);
    }
}
