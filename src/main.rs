mod config;
mod cpu_stress;
mod killfile;
mod memory_stress;
mod stop_signal;
mod supervisor;
mod worker;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::{ConfigError, Preset, RunConfig};
use stop_signal::{LocalFlag, StopSignal};
use supervisor::Supervisor;

/// Exit status for an invalid configuration.
const EXIT_CONFIG: u8 = 2;

/// Bounded synthetic CPU and memory load generator.
///
/// Runs CPU load workers (one process each) and an optional memory worker
/// until the duration elapses, the killfile appears, or Ctrl-C is pressed.
#[derive(Parser, Debug)]
#[command(name = "loadgen", version, about)]
struct Cli {
    /// Starting values; individual flags override them
    #[arg(long, value_enum, default_value_t = Preset::Standard)]
    preset: Preset,

    /// Number of CPU load worker processes
    #[arg(short, long, env = "LOADGEN_WORKERS", allow_negative_numbers = true)]
    workers: Option<i64>,

    /// Run time in seconds, 0 runs until killfile or Ctrl-C
    #[arg(short, long, env = "LOADGEN_DURATION", allow_negative_numbers = true)]
    duration: Option<i64>,

    /// Memory to allocate and hold, in MiB (0 disables)
    #[arg(long, env = "LOADGEN_MEM_MB", allow_negative_numbers = true)]
    mem_mb: Option<i64>,

    /// Stop as soon as this path exists (empty disables)
    #[arg(long, env = "LOADGEN_KILLFILE")]
    killfile: Option<String>,

    /// Validate and print the resolved configuration, don't run
    #[arg(long)]
    dry_run: bool,

    /// Debug logging (worker lifecycle, ramp progress)
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings, errors and the final summary
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn run_config(&self) -> Result<RunConfig, ConfigError> {
        let preset = self.preset;
        RunConfig::new(
            self.workers.unwrap_or_else(|| preset.workers()),
            self.duration.unwrap_or_else(|| preset.duration_secs()),
            self.mem_mb.unwrap_or_else(|| preset.mem_mb()),
            self.killfile.as_ref().map(PathBuf::from).or_else(|| preset.killfile()),
        )
    }

    fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level())),
        )
        .with_target(false)
        .init();
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match cli.run_config() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if cli.dry_run {
        println!("{config}");
        return ExitCode::SUCCESS;
    }

    let interrupt = LocalFlag::default();
    let handler_flag = interrupt.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_flag.set()) {
        tracing::error!(error = %err, "failed to install interrupt handler");
        return ExitCode::FAILURE;
    }

    match Supervisor::new(config).with_interrupt(interrupt).run() {
        Ok(report) => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, "run could not start");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults_use_standard_preset() {
        let cli = Cli::try_parse_from(["loadgen"]).unwrap();
        let config = cli.run_config().unwrap();
        assert_eq!(config.workers(), 2);
        assert_eq!(config.duration(), Some(Duration::from_secs(60)));
        assert_eq!(config.mem_mb(), 0);
        assert!(config.killfile().is_none());
    }

    #[test]
    fn test_flags_override_preset() {
        let cli = Cli::try_parse_from([
            "loadgen", "--preset", "heavy", "--workers", "1", "--mem-mb", "25",
        ])
        .unwrap();
        let config = cli.run_config().unwrap();
        assert_eq!(config.workers(), 1);
        assert_eq!(config.duration(), None);
        assert_eq!(config.mem_mb(), 25);
        assert!(config.killfile().is_some());
    }

    #[test]
    fn test_empty_killfile_disables_monitor() {
        let cli = Cli::try_parse_from(["loadgen", "--preset", "heavy", "--killfile", ""]).unwrap();
        assert!(cli.run_config().unwrap().killfile().is_none());
    }

    #[test]
    fn test_negative_duration_is_a_config_error() {
        let cli = Cli::try_parse_from(["loadgen", "--duration", "-3"]).unwrap();
        assert_eq!(
            cli.run_config().unwrap_err(),
            ConfigError::NegativeDuration(-3)
        );
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["loadgen", "-v", "-q"]).is_err());
    }

    #[test]
    fn test_log_level_follows_flags() {
        assert_eq!(Cli::try_parse_from(["loadgen", "-v"]).unwrap().log_level(), "debug");
        assert_eq!(Cli::try_parse_from(["loadgen", "-q"]).unwrap().log_level(), "warn");
        assert_eq!(Cli::try_parse_from(["loadgen"]).unwrap().log_level(), "info");
    }
}
