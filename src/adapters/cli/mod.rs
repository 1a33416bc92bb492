//! CLI Adapter
//!
//! Command-line interface for Butters Scout.
//! Uses clap derive macros for argument parsing.

mod commands;

pub use commands::{
    build_runtime, CheckConfigCmd, CliApp, Command, EstimateCostCmd, RunCmd, Runtime, StateCmd,
};

use anyhow::Result;

/// Initialize the CLI application
pub fn init() -> CliApp {
    use clap::Parser;
    CliApp::parse()
}

/// Execute the CLI command
pub async fn execute(app: CliApp) -> Result<()> {
    commands::execute(app).await
}
