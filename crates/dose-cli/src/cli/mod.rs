mod commands;
mod plan;

use clap::Parser;
use dose_core::DoseError;
use tracing_subscriber::EnvFilter;

const PROGRAM_NAME: &str = "dose-engine";

pub fn run_from_env() -> i32 {
    init_tracing();
    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(args) {
        Ok(code) => code,
        Err(error) => {
            let error = error.as_dose_error();
            eprintln!("{}", error.diagnostic_line());
            if let Some(summary_line) = error.fatal_exit_line() {
                eprintln!("{summary_line}");
            }
            error.exit_code()
        }
    }
}

/// `RUST_LOG` selects the filter; warnings and errors are shown otherwise.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

pub fn run<I, S>(args: I) -> Result<i32, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let full_args = std::iter::once(PROGRAM_NAME.to_string())
        .chain(args.into_iter().map(Into::into))
        .collect::<Vec<_>>();
    match Cli::try_parse_from(&full_args) {
        Ok(cli) => dispatch_parsed(cli.command),
        Err(err) => match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                print!("{err}");
                Ok(0)
            }
            _ => Err(CliError::Usage(err.to_string())),
        },
    }
}

#[derive(Parser)]
#[command(name = "dose-engine", version, about = "Radiotherapy dose calculation engine")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Calculate dose for a plan file and write a dose archive
    Calculate(commands::CalculateArgs),
    /// Print metadata and statistics of a dose archive
    Inspect(commands::InspectArgs),
    /// List accepted algorithm names
    Algorithms,
}

fn dispatch_parsed(command: CliCommand) -> Result<i32, CliError> {
    match command {
        CliCommand::Calculate(args) => commands::run_calculate_command(args),
        CliCommand::Inspect(args) => commands::run_inspect_command(args),
        CliCommand::Algorithms => commands::run_algorithms_command(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Compute(DoseError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<DoseError> for CliError {
    fn from(error: DoseError) -> Self {
        Self::Compute(error)
    }
}

impl CliError {
    fn as_dose_error(&self) -> DoseError {
        match self {
            Self::Usage(message) => DoseError::validation("INPUT.CLI_USAGE", message.trim_end()),
            Self::Compute(error) => error.clone(),
            Self::Internal(error) => DoseError::io_system("IO.CLI", format!("{error:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CliError, run};
    use dose_core::DoseErrorCategory;

    #[test]
    fn unknown_subcommands_are_usage_errors() {
        let error = run(["transmogrify"]).expect_err("unknown command");
        assert!(matches!(error, CliError::Usage(_)));
        assert_eq!(error.as_dose_error().category(), DoseErrorCategory::Validation);
        assert_eq!(error.as_dose_error().exit_code(), 2);
    }

    #[test]
    fn help_exits_successfully() {
        assert_eq!(run(["--help"]).expect("help"), 0);
    }

    #[test]
    fn internal_errors_map_to_io_diagnostics() {
        let error = CliError::from(anyhow::anyhow!("stdout closed"));
        let diagnostic = error.as_dose_error();
        assert_eq!(diagnostic.placeholder(), "IO.CLI");
        assert!(diagnostic.diagnostic_line().contains("stdout closed"));
    }
}
