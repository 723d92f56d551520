use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use deploygate::observability::LogFormat;
use deploygate::report::ReportFormat;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "deploygate",
    version,
    about = "Deploy a stage graph to several backends and gate on readiness",
    propagate_version = true
)]
pub struct Cli {
    /// Log line format
    #[arg(
        long,
        value_enum,
        global = true,
        default_value_t = LogFormatArg::Pretty,
        env = "DEPLOYGATE_LOG_FORMAT"
    )]
    pub log_format: LogFormatArg,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Deploy every stage to each backend and report readiness
    Run(RunArgs),
    /// Print the execution order each backend would follow
    Plan(PlanArgs),
    /// Validate a configuration file
    Check(CheckArgs),
    /// List known backends with availability and capabilities
    Backends(BackendsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Configuration file (YAML or JSON)
    #[arg(short, long, env = "DEPLOYGATE_CONFIG")]
    pub config: PathBuf,

    /// Backends to deploy to, comma separated
    #[arg(
        short,
        long,
        required = true,
        value_delimiter = ',',
        env = "DEPLOYGATE_BACKENDS"
    )]
    pub backends: Vec<String>,

    /// Run deadline in seconds; 0 disables it
    #[arg(short, long, env = "DEPLOYGATE_TIMEOUT")]
    pub timeout: Option<u64>,

    /// Stages in flight per backend
    #[arg(long, env = "DEPLOYGATE_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Report format written to stdout
    #[arg(
        short,
        long,
        value_enum,
        default_value_t = OutputFormat::Text,
        env = "DEPLOYGATE_FORMAT"
    )]
    pub format: OutputFormat,

    /// Also write the JSON report to this path
    #[arg(long, env = "DEPLOYGATE_REPORT_FILE")]
    pub report_file: Option<PathBuf>,

    /// Deploy every stage even if it already reports ready
    #[arg(long)]
    pub no_precheck: bool,
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Configuration file (YAML or JSON)
    #[arg(short, long, env = "DEPLOYGATE_CONFIG")]
    pub config: PathBuf,

    /// Backends to plan for, comma separated
    #[arg(
        short,
        long,
        required = true,
        value_delimiter = ',',
        env = "DEPLOYGATE_BACKENDS"
    )]
    pub backends: Vec<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = ListFormat::Text)]
    pub format: ListFormat,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Configuration file (YAML or JSON)
    #[arg(short, long, env = "DEPLOYGATE_CONFIG")]
    pub config: PathBuf,
}

#[derive(Args, Debug)]
pub struct BackendsArgs {
    /// Configuration file adding named backend instances
    #[arg(short, long, env = "DEPLOYGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = ListFormat::Text)]
    pub format: ListFormat,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Json => Self::Json,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Jsonl,
}

impl From<OutputFormat> for ReportFormat {
    fn from(arg: OutputFormat) -> Self {
        match arg {
            OutputFormat::Text => Self::Text,
            OutputFormat::Json => Self::Json,
            OutputFormat::Jsonl => Self::Jsonl,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListFormat {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args_parse_backend_list() {
        let cli = Cli::try_parse_from([
            "deploygate",
            "-vv",
            "run",
            "--config",
            "deploy.yaml",
            "--backends",
            "local,docker",
            "--timeout",
            "30",
            "--format",
            "jsonl",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.backends, vec!["local", "docker"]);
        assert_eq!(args.timeout, Some(30));
        assert_eq!(args.format, OutputFormat::Jsonl);
        assert!(!args.no_precheck);
    }

    #[test]
    fn test_run_requires_backends() {
        let parsed = Cli::try_parse_from(["deploygate", "run", "--config", "deploy.yaml"]);
        if std::env::var_os("DEPLOYGATE_BACKENDS").is_none() {
            assert!(parsed.is_err());
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "deploygate",
            "check",
            "--config",
            "deploy.yaml",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormatArg::Json);
        assert_eq!(LogFormat::from(cli.log_format), LogFormat::Json);
    }
}
