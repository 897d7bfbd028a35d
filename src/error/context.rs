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

use crate::error::ResmutexError;
use crate::locking::LockMode;
use std::fmt;

pub struct ErrorContext<'a> {
    pub error: &'a ResmutexError,
    pub suggestion: Option<String>,
    pub details: Option<String>,
}

impl<'a> ErrorContext<'a> {
    pub fn new(error: &'a ResmutexError) -> Self {
        let (suggestion, details) = match error {
            ResmutexError::UnknownLockMode(mode) => {
                let modes = LockMode::ALL
                    .iter()
                    .map(|mode| format!("'{mode}'"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let suggestion = Some(format!("Use one of the supported lock modes: {modes}."));
                let details = Some(format!("Received mode: '{mode}'"));
                (suggestion, details)
            }
            ResmutexError::InvalidTimeout(_) => {
                let suggestion = Some(
                    "Timeouts accept whole seconds ('30'), durations such as '250ms' or '2m', or \
                     the word 'infinite'."
                        .to_string(),
                );
                (suggestion, None)
            }
            ResmutexError::NoRuntime => {
                let suggestion = Some(
                    "Create the lock manager from inside a tokio runtime, for example within \
                     #[tokio::main] or Runtime::block_on."
                        .to_string(),
                );
                (suggestion, None)
            }
            ResmutexError::LockNotHeld { resource } => {
                let suggestion = Some(
                    "The lock was already released by unlock, cancellation or its timeout. \
                     Request a new lock before upgrading."
                        .to_string(),
                );
                let details = Some(format!("Resource: {resource}"));
                (suggestion, details)
            }
            ResmutexError::UpgradeInProgress { resource } => {
                let suggestion = Some(
                    "Wait for the pending upgrade callback, or downgrade before upgrading again."
                        .to_string(),
                );
                let details = Some(format!("Resource: {resource}"));
                (suggestion, details)
            }
            ResmutexError::RequestAbandoned { resource } => {
                let details = Some(format!(
                    "The request on '{resource}' was cancelled, released or its manager shut \
                     down before the callback ran."
                ));
                (None, details)
            }
            ResmutexError::ConfigError(msg) => {
                let suggestion = Some(
                    "Check resmutex.toml syntax. Values under [locking] must be strings or \
                     integers."
                        .to_string(),
                );
                let details = Some(msg.clone());
                (suggestion, details)
            }
            ResmutexError::InvalidScenario(msg) => {
                let suggestion = Some(
                    "Each [[client]] entry needs a unique name and a mode. Clients that never \
                     unlock need a 'timeout' or 'cancel' value."
                        .to_string(),
                );
                let details = Some(msg.clone());
                (suggestion, details)
            }
            ResmutexError::Io(io_err) => {
                let details = Some(format!("I/O error: {io_err}"));
                (None, details)
            }
            ResmutexError::Json(json_err) => {
                let details = Some(format!("JSON error: {json_err}"));
                (None, details)
            }
        };

        Self {
            error,
            suggestion,
            details,
        }
    }

    pub fn with_suggestion(mut self, suggestion: String) -> Self {
        self.suggestion = Some(suggestion);
        self
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }
}

impl<'a> fmt::Display for ErrorContext<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: {}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\n\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}
