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

pub struct ConfigCommand<'a> {
    config: &'a ResmutexConfig,
}

impl<'a> ConfigCommand<'a> {
    pub fn new(config: &'a ResmutexConfig) -> Result<Self> {
        Ok(Self { config })
    }

    /// Prints the loaded configuration followed by the effective default timeout.
    pub fn execute(&self, default_timeout: Option<&str>) -> Result<()> {
        let resolution = self.config.locking.resolve_default_timeout(default_timeout)?;

        print!("{}", self.config.to_toml()?);
        println!();
        println!(
            "# effective default_timeout = \"{}\" ({})",
            resolution.value, resolution.source
        );
        Ok(())
    }
}
