//! Stagehand CLI
//!
//! Parses arguments, initialises logging, drives one run and maps it to a
//! process exit status. Host binaries pass in the catalog of configs,
//! providers and test files they ship.

pub mod demo;
pub mod output;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stagehand_common::{EnvOverrides, CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH};
use stagehand_e2e::{Catalog, Runner, RunnerOptions};

use output::OutputFormat;

/// Stagehand - end-to-end UI test orchestration
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file or registered config module
    #[arg(short, long, env = CONFIG_ENV_VAR, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Stop after the first test failure
    #[arg(long)]
    pub bail: bool,

    /// Only run tests whose full title matches this pattern
    #[arg(long)]
    pub grep: Option<String>,

    /// Only log errors
    #[arg(long, conflicts_with_all = ["debug", "verbose"])]
    pub quiet: bool,

    /// Log debug output
    #[arg(long, conflicts_with = "verbose")]
    pub debug: bool,

    /// Log everything
    #[arg(short, long)]
    pub verbose: bool,

    /// Write a JSON run report to this path
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Summary format
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

impl Args {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "trace"
        } else if self.debug {
            "debug"
        } else {
            "info"
        }
    }

    pub fn runner_options(&self, env: EnvOverrides) -> RunnerOptions {
        RunnerOptions {
            config_path: self.config.clone(),
            bail: self.bail.then_some(true),
            grep: self.grep.clone(),
            env,
            report_path: self.report.clone(),
        }
    }
}

pub fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .init();
}

/// Parse the process arguments, run, print the summary and return the exit code
pub async fn run_cli(catalog: Catalog) -> i32 {
    let args = Args::parse();
    init_logging(args.log_level());

    tracing::debug!(config = %args.config.display(), format = ?args.format, "starting run");
    let runner = Runner::new(args.runner_options(EnvOverrides::from_env()), catalog);
    let outcome = runner.run().await;

    output::print_outcome(&outcome, args.format);
    outcome.exit_code
}
