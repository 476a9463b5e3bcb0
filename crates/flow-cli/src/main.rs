//! `flow` command-line interface
//!
//! Checks, compiles, runs and tests Flow programs against DuckDB.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flow_ast::Program;
use flow_compiler::{Executor, TestOutcome, TestReport, TestRunner, Validator};
use flow_duck::DuckBackend;
use tracing::info;

mod config;
mod logging;

use config::Config;

#[derive(Debug, Parser)]
#[command(name = "flow", version, about = "Compile, run and test Flow pipelines")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "flow.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parse and validate a program and each of its test blocks
    Check { file: PathBuf },

    /// Print the compiled operations and their fingerprint as JSON
    Compile {
        file: PathBuf,

        #[arg(long)]
        pretty: bool,
    },

    /// Execute the top-level statements
    Run {
        file: PathBuf,

        /// DuckDB database file, overriding the configured one
        #[arg(long)]
        database: Option<String>,
    },

    /// Run every test block, each on a fresh in-memory database
    Test {
        file: PathBuf,

        #[arg(long, conflicts_with = "sequential")]
        parallel: bool,

        #[arg(long)]
        sequential: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init(&config.logging);

    match cli.command {
        Command::Check { file } => check(&file),
        Command::Compile { file, pretty } => compile(&file, pretty),
        Command::Run { file, database } => {
            let database = database.unwrap_or(config.execution.database);
            run(&file, &database)
        }
        Command::Test {
            file,
            parallel,
            sequential,
            json,
        } => {
            let parallel = if parallel || sequential {
                parallel
            } else {
                config.execution.parallel_tests
            };
            test(&file, parallel, json)
        }
    }
}

fn read_program(file: &Path) -> Result<Program> {
    let source = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    flow_ast::parse(&source).with_context(|| format!("parsing {}", file.display()))
}

fn check(file: &Path) -> Result<ExitCode> {
    let program = read_program(file)?;
    Validator::new().validate(&program.statements)?;

    let mut blocks = 0;
    for block in program.test_blocks() {
        Validator::new()
            .validate(&block.statements)
            .with_context(|| format!("test \"{}\"", block.name))?;
        blocks += 1;
    }

    println!(
        "{}: ok ({} statements, {} test blocks)",
        file.display(),
        program.statements.len(),
        blocks
    );
    Ok(ExitCode::SUCCESS)
}

fn compile(file: &Path, pretty: bool) -> Result<ExitCode> {
    let program = read_program(file)?;
    let unit = flow_compiler::compile(&program.statements)?;

    let output = serde_json::json!({
        "fingerprint": unit.fingerprint(),
        "operations": unit.operations,
    });
    let text = if pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{}", text);
    Ok(ExitCode::SUCCESS)
}

fn run(file: &Path, database: &str) -> Result<ExitCode> {
    let program = read_program(file)?;
    let unit = flow_compiler::compile(&program.statements)?;

    let mut backend = DuckBackend::connect(database)?;
    info!(file = %file.display(), database, operations = unit.len(), "Running program");
    let report = Executor::from_env().execute(&unit.operations, &mut backend)?;

    println!(
        "{} operations, {} assertions, {} sinks written",
        report.operations, report.assertions, report.persisted
    );
    Ok(ExitCode::SUCCESS)
}

fn test(file: &Path, parallel: bool, json: bool) -> Result<ExitCode> {
    let program = read_program(file)?;
    let runner = TestRunner::from_env();
    let report = if parallel {
        runner.run_parallel(&program, DuckBackend::fresh)
    } else {
        runner.run(&program, DuckBackend::fresh)
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_report(report: &TestReport) {
    for result in &report.results {
        match &result.outcome {
            TestOutcome::Passed => println!("PASS  {}", result.name),
            TestOutcome::Failed(assertion) => println!("FAIL  {}: assertion failed: {}", result.name, assertion),
            TestOutcome::Error(error) => println!("ERROR {}: {}", result.name, error),
        }
    }
    println!(
        "\n{} passed, {} failed, {} errors",
        report.passed(),
        report.failed(),
        report.errored()
    );
}
