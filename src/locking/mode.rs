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
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Access mode requested for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Single holder, excludes every other mode.
    Exclusive,
    /// Any number of concurrent holders; excludes exclusive holders.
    Shared,
    /// Single holder that tolerates concurrent shared holders and may be
    /// promoted to exclusive.
    Upgradable,
}

impl LockMode {
    pub const ALL: [LockMode; 3] = [
        LockMode::Exclusive,
        LockMode::Shared,
        LockMode::Upgradable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Exclusive => "exclusive",
            LockMode::Shared => "shared",
            LockMode::Upgradable => "upgradable",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockMode {
    type Err = ResmutexError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        LockMode::ALL
            .into_iter()
            .find(|mode| trimmed.eq_ignore_ascii_case(mode.as_str()))
            .ok_or_else(|| ResmutexError::UnknownLockMode(trimmed.to_string()))
    }
}

/// Mode currently in force on a resource, derived from its holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HolderMode {
    None,
    Exclusive,
    Shared,
    Upgradable,
}

impl fmt::Display for HolderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HolderMode::None => "none",
            HolderMode::Exclusive => "exclusive",
            HolderMode::Shared => "shared",
            HolderMode::Upgradable => "upgradable",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modes_case_insensitively() {
        assert_eq!("exclusive".parse::<LockMode>().unwrap(), LockMode::Exclusive);
        assert_eq!(" Shared ".parse::<LockMode>().unwrap(), LockMode::Shared);
        assert_eq!("UPGRADABLE".parse::<LockMode>().unwrap(), LockMode::Upgradable);
    }

    #[test]
    fn rejects_unknown_mode() {
        let err = "intent".parse::<LockMode>().unwrap_err();
        assert!(matches!(err, ResmutexError::UnknownLockMode(ref mode) if mode == "intent"));
    }

    #[test]
    fn display_matches_parse_input() {
        for mode in LockMode::ALL {
            assert_eq!(mode.to_string().parse::<LockMode>().unwrap(), mode);
        }
    }
}
