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

use std::fmt;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{self, Instant};

/// Hold budget applied to a granted lock before it is released automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockTimeoutValue {
    Finite(Duration),
    #[default]
    Infinite,
}

impl LockTimeoutValue {
    pub const fn from_secs(seconds: u64) -> Self {
        Self::Finite(Duration::from_secs(seconds))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self::Finite(Duration::from_millis(millis))
    }

    /// Returns the finite budget, or `None` when locks are held until unlocked.
    ///
    /// A zero budget arms no timer.
    pub fn as_option(&self) -> Option<Duration> {
        match self {
            LockTimeoutValue::Finite(duration) if !duration.is_zero() => Some(*duration),
            LockTimeoutValue::Finite(_) | LockTimeoutValue::Infinite => None,
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, LockTimeoutValue::Infinite)
    }
}

impl From<Option<Duration>> for LockTimeoutValue {
    fn from(value: Option<Duration>) -> Self {
        value.map_or(LockTimeoutValue::Infinite, LockTimeoutValue::Finite)
    }
}

impl fmt::Display for LockTimeoutValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTimeoutValue::Infinite => f.write_str("infinite"),
            LockTimeoutValue::Finite(duration) => {
                write!(f, "{}", humantime::format_duration(*duration))
            }
        }
    }
}

/// Source precedence used when resolving the effective default timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockTimeoutSource {
    #[default]
    Default,
    Config,
    Environment,
    Cli,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeoutResolution {
    pub value: LockTimeoutValue,
    pub source: LockTimeoutSource,
}

impl fmt::Display for LockTimeoutSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LockTimeoutSource::Default => "built-in default",
            LockTimeoutSource::Config => "configuration file",
            LockTimeoutSource::Environment => "environment variable",
            LockTimeoutSource::Cli => "CLI flag",
        };
        f.write_str(label)
    }
}

/// Error produced when parsing a timeout value fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTimeoutParseError {
    message: String,
}

impl fmt::Display for LockTimeoutParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LockTimeoutParseError {}

impl LockTimeoutParseError {
    fn invalid_value(value: &str) -> Self {
        Self {
            message: format!(
                "Lock timeout value '{value}' is invalid. Use an integer number of seconds, a \
                 duration such as '250ms', or the word 'infinite'."
            ),
        }
    }
}

/// Parses a timeout value originating from CLI, environment, configuration or a scenario file.
///
/// Bare integers are seconds; anything else goes through `humantime` (`250ms`, `1m 30s`).
pub fn parse_timeout_override(value: &str) -> Result<LockTimeoutValue, LockTimeoutParseError> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("infinite") {
        return Ok(LockTimeoutValue::Infinite);
    }

    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Ok(LockTimeoutValue::from_secs(seconds));
    }

    humantime::parse_duration(trimmed)
        .map(LockTimeoutValue::Finite)
        .map_err(|_| LockTimeoutParseError::invalid_value(trimmed))
}

/// Resolves the effective default timeout based on CLI > env > config > default precedence.
pub struct LockTimeoutResolver<'a> {
    cli_override: Option<&'a str>,
    env_override: Option<&'a str>,
    config_value: LockTimeoutValue,
    default_value: LockTimeoutValue,
}

impl<'a> LockTimeoutResolver<'a> {
    pub fn new(
        cli_override: Option<&'a str>,
        env_override: Option<&'a str>,
        config_value: LockTimeoutValue,
        default_value: LockTimeoutValue,
    ) -> Self {
        Self {
            cli_override,
            env_override,
            config_value,
            default_value,
        }
    }

    pub fn resolve(self) -> Result<LockTimeoutResolution, LockTimeoutParseError> {
        if let Some(cli_value) = self.cli_override {
            let value = parse_timeout_override(cli_value)?;
            return Ok(LockTimeoutResolution {
                value,
                source: LockTimeoutSource::Cli,
            });
        }

        if let Some(env_value) = self.env_override {
            let value = parse_timeout_override(env_value)?;
            return Ok(LockTimeoutResolution {
                value,
                source: LockTimeoutSource::Environment,
            });
        }

        if self.config_value != self.default_value {
            return Ok(LockTimeoutResolution {
                value: self.config_value,
                source: LockTimeoutSource::Config,
            });
        }

        Ok(LockTimeoutResolution {
            value: self.default_value,
            source: LockTimeoutSource::Default,
        })
    }
}

/// Schedules `on_expiry` to run once `after` has elapsed from now.
///
/// The deadline is fixed when this is called, not when the task is first polled.
pub(crate) fn spawn_expiry<F>(runtime: &Handle, after: Duration, on_expiry: F) -> AbortHandle
where
    F: FnOnce() + Send + 'static,
{
    let deadline = Instant::now() + after;
    runtime
        .spawn(async move {
            time::sleep_until(deadline).await;
            on_expiry();
        })
        .abort_handle()
}
