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

use crate::config::ResmutexConfig;
use crate::error::Result;
use crate::simulation::{Scenario, Simulation};
use log::info;
use std::io::{self, IsTerminal};
use std::path::Path;

pub struct SimulateCommand<'a> {
    config: &'a ResmutexConfig,
}

impl<'a> SimulateCommand<'a> {
    pub fn new(config: &'a ResmutexConfig) -> Result<Self> {
        Ok(Self { config })
    }

    pub fn execute(
        &self,
        scenario_path: &Path,
        default_timeout: Option<&str>,
        json: bool,
    ) -> Result<()> {
        let resolution = self.config.locking.resolve_default_timeout(default_timeout)?;
        info!(
            "Default lock timeout {} (from {})",
            resolution.value, resolution.source
        );

        let scenario = Scenario::load(scenario_path)?;
        let simulation = Simulation::new(scenario, resolution.value)?;

        // Timers and callbacks stay on one thread so equal deadlines keep request order.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let report = runtime.block_on(simulation.run())?;

        if json {
            print!("{}", report.render_json()?);
        } else {
            print!("{}", report.render_text(io::stdout().is_terminal()));
        }
        Ok(())
    }
}
