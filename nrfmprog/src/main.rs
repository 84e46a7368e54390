mod cli;
mod config;
mod progress;

use anyhow::{Result, anyhow};
use clap::Parser;
use nrfmprog_lib::{
    OperationOutcome, Orchestrator, ProbeRsTransport, ProgrammingRequest, SessionReport,
};
use std::process;

use crate::cli::{Cli, merge_config};
use crate::config::NrfmprogConfig;
use crate::progress::create_progress_callback;

fn main() {
    // Log level comes from RUST_LOG, e.g. RUST_LOG=debug or
    // RUST_LOG=nrfmprog_lib=trace
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Cli::parse();
    match run(&args) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

/// Returns whether every target was programmed.
fn run(args: &Cli) -> Result<bool> {
    let config = match &args.config {
        Some(path) => {
            let config = NrfmprogConfig::from_file(path)?;
            config
                .validate()
                .map_err(|e| anyhow!("Invalid config file {}: {}", path, e))?;
            Some(config)
        }
        None => None,
    };

    let merged = merge_config(args, config)?;
    let request = ProgrammingRequest::new(
        merged.file,
        Some(merged.family),
        merged.snrs,
        merged.options,
    )?;

    let mut orchestrator = Orchestrator::new(ProbeRsTransport::new());
    if !merged.quiet {
        orchestrator = orchestrator.with_progress(create_progress_callback());
    }

    let mut outcomes = orchestrator.run(&request)?;
    if outcomes.is_empty() {
        eprintln!("No debug probes found, nothing was programmed");
        return Ok(false);
    }

    outcomes.sort_by(|a, b| a.target.cmp(&b.target));
    print_summary(&outcomes);
    Ok(outcomes.iter().all(OperationOutcome::is_success))
}

fn print_summary(outcomes: &[OperationOutcome]) {
    println!();
    for outcome in outcomes {
        match &outcome.result {
            Ok(report) => println!("{}: OK ({})", outcome.target, describe(report)),
            Err(e) => println!("{}: FAILED during {}: {}", outcome.target, e.phase, e.source),
        }
    }

    let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
    println!(
        "{}/{} target(s) programmed successfully",
        succeeded,
        outcomes.len()
    );
}

fn describe(report: &SessionReport) -> String {
    let mut parts = Vec::new();
    if report.recovered {
        parts.push("recovered".to_string());
    }
    if report.uicr_erased {
        parts.push("UICR erased".to_string());
    }
    if report.pages_erased > 0 {
        parts.push(format!("{} page(s) erased", report.pages_erased));
    }
    parts.push(format!("{} bytes written", report.bytes_written));
    if report.verified {
        parts.push("verified".to_string());
    }
    if report.reset {
        parts.push("reset".to_string());
    }
    parts.join(", ")
}
