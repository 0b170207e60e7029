use anyhow::Context;
use clap::Parser;
use perftrace_cli::cli::{Cli, Command};
use perftrace_cli::commands::record::RecordOptions;
use perftrace_cli::error::{exit_code, exit_code_for};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

perftrace::profiler!();

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(err) = e.downcast_ref::<perftrace::Error>() {
                ExitCode::from(exit_code_for(err) as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    // Validate CLI arguments
    cli.validate()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("Invalid arguments")?;

    match cli.command {
        Command::Record {
            output,
            duration,
            cpu_freq,
            threads,
            sample_interval,
        } => {
            let options = RecordOptions {
                prefix: output,
                duration,
                cpu_freq,
                threads,
                sample_interval,
            };
            let summary = perftrace_cli::commands::record::run(&options)?;

            eprintln!(
                "Recorded {} iterations, {} CPU samples",
                summary.iterations, summary.cpu_samples
            );
            eprintln!("CPU profile:    {}", summary.cpu_profile.display());
            if let Some(heap) = &summary.heap_profile {
                eprintln!("Heap profile:   {}", heap.display());
            }
            eprintln!(
                "Leak report:    {} ({} bytes in {} objects)",
                summary.leak_profile.display(),
                summary.leaked_bytes,
                summary.leaked_objects
            );
            eprintln!(
                "Sampled traces: {} ({} traces)",
                summary.sampled_profile.display(),
                summary.sampled_traces
            );
        }
        Command::List { dir } => {
            perftrace_cli::commands::list::run(dir.as_deref())?;
        }
        Command::Clean { prefix } => {
            perftrace_cli::commands::clean::run(&prefix);
        }
        Command::Completions { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "perftrace", &mut std::io::stdout());
        }
    }

    Ok(())
}
