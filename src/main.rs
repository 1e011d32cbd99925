use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use shimrunner::{report, Harness, HarnessOptions, ShimConfig, TestCases};

#[derive(Parser)]
#[command(
    name = "shimrunner",
    about = "Interop test harness that relays UDP datagrams between client and server shims",
    version,
    long_about = None
)]
struct Cli {
    /// Verbose debugging (subprocess output, relay traffic)
    #[arg(long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the test cases against the configured shims
    Run {
        /// Shim configuration file (client/server paths and args)
        #[arg(long, default_value = "test.json")]
        shims: PathBuf,

        /// Test cases file
        #[arg(long, default_value = "cases.json")]
        cases: PathBuf,

        /// Only run cases whose name contains this string
        #[arg(long)]
        filter: Option<String>,

        /// Print one JSON line per case, then the aggregate result as JSON
        #[arg(long)]
        json: bool,

        /// Per-case timeout in seconds (0 disables)
        #[arg(long, default_value = "60")]
        case_timeout_secs: u64,

        /// How long to wait for the server's port announcement, in seconds
        #[arg(long, default_value = "10")]
        startup_timeout_secs: u64,

        /// Host the relay sockets bind to (`::` is dual-stack, falling back to IPv4)
        #[arg(long, default_value = "::")]
        bind_host: String,

        /// Host passed to shims in -addr
        #[arg(long, default_value = "localhost")]
        advertise_host: String,
    },

    /// List the configured test cases
    List {
        /// Test cases file
        #[arg(long, default_value = "cases.json")]
        cases: PathBuf,
    },
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            println!("Internal error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn dispatch(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Run {
            shims,
            cases,
            filter,
            json,
            case_timeout_secs,
            startup_timeout_secs,
            bind_host,
            advertise_host,
        } => {
            let shims = ShimConfig::load(&shims)?;
            let cases = TestCases::load(&cases)?.filtered(filter.as_deref());

            let options = HarnessOptions {
                bind_host,
                advertise_host,
                startup_timeout: Duration::from_secs(startup_timeout_secs),
                case_timeout: (case_timeout_secs > 0).then(|| Duration::from_secs(case_timeout_secs)),
                ..HarnessOptions::default()
            };
            tracing::info!(cases = cases.cases.len(), "starting test run");

            let harness = Harness::new(shims, options);
            let status = harness
                .run_all(&cases.cases, |result| {
                    if json {
                        match serde_json::to_string(result) {
                            Ok(line) => println!("{}", line),
                            Err(e) => tracing::warn!(error = %e, "failed to encode case result"),
                        }
                        return;
                    }
                    if let Some(failure) = result.failure() {
                        println!("{}", report::format_failure(&failure));
                    }
                })
                .await?;

            if json {
                println!("{}", serde_json::to_string(&status)?);
            } else {
                println!("{}", report::format_summary(&status));
            }

            Ok(if status.all_passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Commands::List { cases } => {
            let cases = TestCases::load(&cases)?;
            if cases.cases.is_empty() {
                println!("No test cases found.");
            } else {
                println!("{:<30} | {:<25} | Server args", "Name", "Client args");
                println!("{:-<30}-|-{:-<25}-|-{:-<25}", "", "", "");
                for case in &cases.cases {
                    println!(
                        "{:<30} | {:<25} | {}",
                        case.name,
                        case.client_args.join(" "),
                        case.server_args.join(" ")
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
