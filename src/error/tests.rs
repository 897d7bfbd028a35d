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

use super::*;
use crate::locking::timeout::parse_timeout_override;

#[test]
fn test_error_context_unknown_mode() {
    let error = ResmutexError::UnknownLockMode("intent".to_string());
    let context = ErrorContext::new(&error);

    let suggestion = context.suggestion.unwrap();
    assert!(suggestion.contains("'exclusive'"));
    assert!(suggestion.contains("'upgradable'"));
    assert!(context.details.unwrap().contains("intent"));
}

#[test]
fn test_error_context_invalid_timeout() {
    let error: ResmutexError = parse_timeout_override("soon").unwrap_err().into();
    let context = ErrorContext::new(&error);

    assert!(error.to_string().contains("soon"));
    assert!(context.suggestion.unwrap().contains("infinite"));
}

#[test]
fn test_error_context_lock_not_held() {
    let error = ResmutexError::LockNotHeld {
        resource: "config.json".to_string(),
    };
    let context = ErrorContext::new(&error);

    assert!(context.details.unwrap().contains("config.json"));
    assert!(context.suggestion.unwrap().contains("already released"));
}

#[test]
fn test_error_context_with_custom_suggestion() {
    let error = ResmutexError::NoRuntime;
    let context = ErrorContext::new(&error).with_suggestion("Use Handle::enter.".to_string());

    assert_eq!(context.suggestion, Some("Use Handle::enter.".to_string()));
}

#[test]
fn test_error_context_display() {
    let error = ResmutexError::InvalidScenario("duplicate client 'A'".to_string());
    let output = ErrorContext::new(&error).to_string();

    assert!(output.starts_with("Error: Invalid scenario"));
    assert!(output.contains("Details: duplicate client 'A'"));
    assert!(output.contains("Suggestion:"));
}

#[test]
fn test_format_without_color_matches_chain() {
    let error = ResmutexError::UpgradeInProgress {
        resource: "r".to_string(),
    };
    assert_eq!(
        format_error_with_color(&error, false),
        format_error_chain(&error)
    );
}

#[test]
fn test_exit_codes() {
    assert_eq!(
        get_exit_code(&ResmutexError::UnknownLockMode("x".to_string())),
        2
    );
    assert_eq!(
        get_exit_code(&ResmutexError::ConfigError("bad".to_string())),
        2
    );
    assert_eq!(
        get_exit_code(&ResmutexError::InvalidScenario("bad".to_string())),
        3
    );
    assert_eq!(
        get_exit_code(&ResmutexError::RequestAbandoned {
            resource: "r".to_string()
        }),
        4
    );
    assert_eq!(get_exit_code(&ResmutexError::NoRuntime), 70);
    assert_eq!(
        get_exit_code(&ResmutexError::Io(std::io::Error::other("boom"))),
        1
    );
}
