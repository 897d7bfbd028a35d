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

//! Replays scripted lock clients against a [`LockManager`](crate::locking::LockManager)
//! and reports the resulting event trace.

pub mod runner;
pub mod scenario;
pub mod trace;

pub use runner::{Simulation, SimulationReport, TraceLine};
pub use scenario::{ClientPlan, Scenario};
pub use trace::{TraceEvent, TraceKind, TraceRecorder};
