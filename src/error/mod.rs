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

mod context;
mod exit_codes;
mod format;
#[cfg(test)]
mod tests;

pub use context::ErrorContext;
pub use exit_codes::get_exit_code;
pub use format::{format_error_chain, format_error_with_color};

use crate::locking::timeout::LockTimeoutParseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResmutexError {
    #[error("Unknown lock mode '{0}'")]
    UnknownLockMode(String),

    #[error(transparent)]
    InvalidTimeout(#[from] LockTimeoutParseError),

    #[error("Lock manager requires a running tokio runtime")]
    NoRuntime,

    #[error("Lock on '{resource}' is no longer held")]
    LockNotHeld { resource: String },

    #[error("An upgrade is already in progress on '{resource}'")]
    UpgradeInProgress { resource: String },

    #[error("Lock request on '{resource}' was abandoned before it completed")]
    RequestAbandoned { resource: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid scenario: {0}")]
    InvalidScenario(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ResmutexError>;
