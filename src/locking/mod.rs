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

mod dispatcher;
pub mod handle;
mod manager;
pub mod mode;
pub mod observer;
pub mod request;
pub mod table;
pub mod timeout;

pub use handle::{AnyGrant, CancelHandle, Grant, UpgradableGrant, UpgradedGrant};
pub use manager::{LockManager, LockManagerBuilder};
pub use mode::{HolderMode, LockMode};
pub use observer::{LockObserver, LoggingObserver, NoopLockObserver};
pub use request::{ReleaseReason, RequestId, RequestState};
pub use table::{ResourceSnapshot, UpgradePhase};
pub use timeout::{
    LockTimeoutResolution, LockTimeoutResolver, LockTimeoutSource, LockTimeoutValue,
    parse_timeout_override,
};
