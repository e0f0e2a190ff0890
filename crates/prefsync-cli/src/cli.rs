//! Command-line client for the desktop preference file.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use prefsync_config::catalog::{
    FLAG_DARWIN, FLAG_LINUX, FLAG_WIN32, host_environment, platform_environment,
};
use prefsync_config::Environment;
use prefsync_telemetry::{LogFormat, LoggingConfig, Metrics, component, init_logging};
use tracing::debug;

use crate::commands::Session;
use crate::commands::preferences::{
    handle_get, handle_keys, handle_reset, handle_set, handle_show,
};
use crate::error::{CliError, CliResult};
use crate::output::OutputFormat;

const DEFAULT_PREFERENCES_FILE: &str = "preferences.json";
const DEFAULT_LOG_LEVEL: &str = "warn";

/// Parses CLI arguments, executes the requested command, and prints its
/// output. Returns the process exit code.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    let logging = LoggingConfig {
        level: &cli.log_level,
        format: cli.log_format.into(),
        component: env!("CARGO_PKG_NAME"),
        span_timings: cli.log_spans,
    };
    if let Err(err) = init_logging(&logging) {
        eprintln!("warning: logging unavailable: {err}");
    }

    match dispatch(cli).await {
        Ok(text) => {
            if !text.is_empty() {
                println!("{text}");
            }
            0
        }
        Err(err) => {
            eprintln!("error: {}", err.display_message());
            err.exit_code()
        }
    }
}

async fn dispatch(cli: Cli) -> CliResult<String> {
    let environment = cli
        .platform
        .map_or_else(host_environment, Platform::environment);
    let metrics = Metrics::new().map_err(CliError::failure)?;
    debug!(
        component = component(),
        file = %cli.file.display(),
        "opening preference file"
    );
    let session = Session::open(&cli.file, environment, &metrics).await?;

    let mut text = match cli.command {
        Command::Show => handle_show(&session, cli.output),
        Command::Get(args) => handle_get(&session, &args.key, cli.output),
        Command::Set(args) => handle_set(session, &args.key, &args.value).await,
        Command::Reset => handle_reset(session).await,
        Command::Keys => handle_keys(&session, cli.output),
    }?;
    if cli.metrics {
        let rendered = metrics.render().map_err(CliError::failure)?;
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(rendered.trim_end());
    }
    Ok(text)
}

#[derive(Parser)]
#[command(name = "prefsync", about = "Inspect and edit desktop preferences")]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "PREFSYNC_FILE",
        default_value = DEFAULT_PREFERENCES_FILE,
        help = "Preference file to read and update"
    )]
    file: PathBuf,
    #[arg(
        long,
        global = true,
        value_enum,
        help = "Evaluate platform rules as if running on this platform"
    )]
    platform: Option<Platform>,
    #[arg(
        long = "output",
        alias = "format",
        global = true,
        value_enum,
        default_value_t = OutputFormat::Table,
        help = "Select output format for commands that render structured data"
    )]
    output: OutputFormat,
    #[arg(
        long,
        global = true,
        env = "PREFSYNC_LOG_LEVEL",
        default_value = DEFAULT_LOG_LEVEL
    )]
    log_level: String,
    #[arg(
        long,
        global = true,
        env = "PREFSYNC_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormatArg::Pretty
    )]
    log_format: LogFormatArg,
    #[arg(long, global = true, help = "Log the duration of every store operation")]
    log_spans: bool,
    #[arg(
        long,
        global = true,
        help = "Append the store's Prometheus metrics for this invocation"
    )]
    metrics: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every preference as the settings window would show it.
    Show,
    /// Show a single preference.
    Get(GetArgs),
    /// Change a preference using its displayed representation.
    Set(SetArgs),
    /// Restore every preference to its default.
    Reset,
    /// List preference keys and kinds.
    Keys,
}

#[derive(Args)]
struct GetArgs {
    #[arg(help = "Preference key")]
    key: String,
}

#[derive(Args)]
struct SetArgs {
    #[arg(help = "Preference key")]
    key: String,
    #[arg(help = "New value as displayed (offsets applied)", allow_hyphen_values = true)]
    value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Platform {
    Linux,
    Darwin,
    Win32,
}

impl Platform {
    fn environment(self) -> Environment {
        let flag = match self {
            Self::Linux => FLAG_LINUX,
            Self::Darwin => FLAG_DARWIN,
            Self::Win32 => FLAG_WIN32,
        };
        platform_environment(flag)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Json => Self::Json,
        }
    }
}
