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

use super::ResmutexError;

pub fn get_exit_code(error: &ResmutexError) -> i32 {
    match error {
        ResmutexError::UnknownLockMode(_)
        | ResmutexError::InvalidTimeout(_)
        | ResmutexError::ConfigError(_) => 2,

        ResmutexError::InvalidScenario(_) => 3,

        ResmutexError::LockNotHeld { .. }
        | ResmutexError::UpgradeInProgress { .. }
        | ResmutexError::RequestAbandoned { .. } => 4,

        ResmutexError::NoRuntime => 70, // EX_SOFTWARE

        _ => 1,
    }
}
