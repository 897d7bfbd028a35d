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

use clap::{Parser, Subcommand};
use resmutex::commands::config::ConfigCommand;
use resmutex::commands::simulate::SimulateCommand;
use resmutex::config::ResmutexConfig;
use resmutex::error::{ResmutexError, Result, format_error_with_color, get_exit_code};
use resmutex::logging;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "resmutex")]
#[command(author, version, about = "Per-resource lock manager simulator", long_about = None)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (defaults to ./resmutex.toml when present)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario of scripted lock clients and print the event trace
    #[command(visible_alias = "sim")]
    Simulate {
        /// Scenario file with [[client]] entries
        scenario: PathBuf,

        /// Default hold timeout (seconds, a duration such as "250ms", or "infinite")
        #[arg(long, value_name = "DURATION")]
        default_timeout: Option<String>,

        /// Print the trace as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration
    Config {
        /// Default hold timeout override to resolve against the configuration
        #[arg(long, value_name = "DURATION")]
        default_timeout: Option<String>,
    },
}

fn load_config(path: Option<&Path>) -> Result<ResmutexConfig> {
    match path {
        Some(path) => ResmutexConfig::load_from(path),
        None => ResmutexConfig::load(Path::new(".")),
    }
}

fn exit_with(error: &ResmutexError) -> ! {
    eprintln!(
        "{}",
        format_error_with_color(error, io::stderr().is_terminal())
    );
    std::process::exit(get_exit_code(error));
}

fn main() {
    let cli = Cli::parse();

    logging::setup_logger(cli.verbose);

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => exit_with(&e),
    };

    let result: Result<()> = (|| match &cli.command {
        Commands::Simulate {
            scenario,
            default_timeout,
            json,
        } => {
            let command = SimulateCommand::new(&config)?;
            command.execute(scenario, default_timeout.as_deref(), *json)
        }
        Commands::Config { default_timeout } => {
            let command = ConfigCommand::new(&config)?;
            command.execute(default_timeout.as_deref())
        }
    })();

    if let Err(e) = result {
        exit_with(&e);
    }
}
