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

//! Shared helpers for lock manager integration tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ordered record of what callbacks observed.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Lets every pending callback run.
///
/// Tests run with paused time, so the clock only moves once the dispatcher
/// and all other tasks are idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[allow(dead_code)]
pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Holds a grant delivered to a callback so the test can act on it later.
pub struct Slot<G>(Arc<Mutex<Option<G>>>);

impl<G> Clone for Slot<G> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<G: Send + 'static> Default for Slot<G> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }
}

#[allow(dead_code)]
impl<G: Send + 'static> Slot<G> {
    /// Callback that logs `"{label} granted"` and stores the grant.
    pub fn recorder(&self, log: &EventLog, label: &str) -> impl FnOnce(G) + Send + use<G> {
        let slot = self.clone();
        let log = log.clone();
        let event = format!("{label} granted");
        move |grant| {
            log.push(event);
            slot.put(grant);
        }
    }

    pub fn put(&self, grant: G) {
        *self.0.lock().unwrap() = Some(grant);
    }

    pub fn is_filled(&self) -> bool {
        self.0.lock().unwrap().is_some()
    }

    pub fn take(&self) -> G {
        self.0
            .lock()
            .unwrap()
            .take()
            .expect("grant has not been delivered")
    }
}
