use clap::{Parser, Subcommand};
use perftrace::config::{DEFAULT_FREQUENCY, DEFAULT_SAMPLE_INTERVAL, MAX_FREQUENCY};
use std::path::PathBuf;
use std::time::Duration;

/// Most worker threads `record` will spawn
const MAX_THREADS: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "perftrace")]
#[command(about = "Record and manage in-process heap and CPU profiles")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Profile a built-in allocation-heavy workload
    Record {
        /// Prefix for the written profiles
        #[arg(long, short = 'o', default_value = "perftrace")]
        output: PathBuf,

        /// Recording duration (default: until Ctrl-C)
        #[arg(long, short = 'd', value_parser = parse_duration)]
        duration: Option<Duration>,

        /// CPU sampling frequency in Hz
        #[arg(long, default_value_t = DEFAULT_FREQUENCY)]
        cpu_freq: u32,

        /// Worker threads running the workload
        #[arg(long, short = 't', default_value = "4")]
        threads: usize,

        /// Bytes allocated between sampled heap stack traces (0 disables)
        #[arg(long, default_value_t = DEFAULT_SAMPLE_INTERVAL)]
        sample_interval: usize,
    },

    /// List CPU and heap profiles
    List {
        /// Directory to search (defaults to current directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Remove `PREFIX.*.heap` profiles left by earlier runs
    Clean {
        /// Profile prefix, e.g. `out/app`
        prefix: PathBuf,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    // Try humantime first
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }

    // Bare number as seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    Err(format!(
        "Invalid duration '{}'. Examples: 500ms, 30s, 5m, 1h30m, 90",
        s
    ))
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if let Command::Record {
            cpu_freq,
            threads,
            duration,
            ..
        } = &self.command
        {
            if *cpu_freq == 0 || *cpu_freq > MAX_FREQUENCY {
                return Err(format!(
                    "CPU frequency must be between 1 and {MAX_FREQUENCY} Hz, got {cpu_freq}"
                ));
            }

            if *threads == 0 || *threads > MAX_THREADS {
                return Err(format!(
                    "Thread count must be between 1 and {MAX_THREADS}, got {threads}"
                ));
            }

            if duration.is_some_and(|d| d.is_zero()) {
                return Err("Duration must be positive".to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("perftrace").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn durations_accept_humantime_and_bare_seconds() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("1m30s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("42"), Ok(Duration::from_secs(42)));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn record_defaults() {
        let cli = parse(&["record"]);
        match cli.command {
            Command::Record {
                ref output,
                duration,
                cpu_freq,
                threads,
                sample_interval,
            } => {
                assert_eq!(*output, PathBuf::from("perftrace"));
                assert_eq!(duration, None);
                assert_eq!(cpu_freq, DEFAULT_FREQUENCY);
                assert_eq!(threads, 4);
                assert_eq!(sample_interval, DEFAULT_SAMPLE_INTERVAL);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        assert!(parse(&["record", "--cpu-freq", "0"]).validate().is_err());
        assert!(parse(&["record", "--cpu-freq", "5000"]).validate().is_err());
        assert!(parse(&["record", "--threads", "0"]).validate().is_err());
        assert!(parse(&["record", "-d", "0s"]).validate().is_err());
        assert!(parse(&["record", "-d", "2s", "-t", "8"]).validate().is_ok());
    }

    #[test]
    fn clean_requires_prefix() {
        assert!(Cli::try_parse_from(["perftrace", "clean"]).is_err());
        let cli = parse(&["clean", "out/app", "--verbose"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Clean { ref prefix } if *prefix == PathBuf::from("out/app")));
    }
}
