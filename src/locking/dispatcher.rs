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

use log::{debug, error, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs posted callbacks one at a time, in posting order, on a dedicated task.
///
/// Posting never runs the job inline, so a callback can never fire inside the
/// call that produced it.
#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    sender: UnboundedSender<Job>,
}

impl Dispatcher {
    pub(crate) fn spawn(runtime: &Handle) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        runtime.spawn(run(receiver));
        Self { sender }
    }

    pub(crate) fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sender.send(Box::new(job)).is_err() {
            warn!("Lock callback dropped: dispatcher is no longer running");
        }
    }
}

async fn run(mut receiver: UnboundedReceiver<Job>) {
    while let Some(job) = receiver.recv().await {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!("Lock callback panicked: {}", panic_message(payload.as_ref()));
        }
    }
    debug!("Lock dispatcher stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn jobs_run_in_posting_order_and_never_inline() {
        let dispatcher = Dispatcher::spawn(&Handle::current());
        let events = Arc::new(Mutex::new(Vec::new()));

        for index in 0..3 {
            let events = events.clone();
            dispatcher.post(move || events.lock().unwrap().push(index));
        }
        assert!(events.lock().unwrap().is_empty());

        let (done_tx, done_rx) = oneshot::channel();
        dispatcher.post(move || {
            let _ = done_tx.send(());
        });
        done_rx.await.unwrap();

        assert_eq!(*events.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn panicking_job_does_not_stop_dispatcher() {
        let dispatcher = Dispatcher::spawn(&Handle::current());
        dispatcher.post(|| panic!("callback failure"));

        let (done_tx, done_rx) = oneshot::channel();
        dispatcher.post(move || {
            let _ = done_tx.send("still running");
        });
        assert_eq!(done_rx.await.unwrap(), "still running");
    }
}
