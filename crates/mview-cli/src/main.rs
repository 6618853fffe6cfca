#![forbid(unsafe_code)]

mod cmd;
mod output;
mod signals;

use clap::{Parser, Subcommand};
use cmd::DataDir;
use cmd::control::Control;
use output::{CliError, OutputMode};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "mview: incremental materialized-view updater",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Directory holding the database, config and lock files.
    #[arg(long, global = true, default_value = ".mview")]
    data_dir: PathBuf,

    /// Config file to use instead of `<data-dir>/config.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Derive the output mode from flags.
    const fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }

    fn data_dir(&self) -> DataDir {
        DataDir::new(self.data_dir.clone(), self.config.clone())
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Setup",
        about = "Initialize a view",
        long_about = "Create the database if needed, the view's changelog table, and an idle state row.",
        after_help = "EXAMPLES:\n    # Initialize a view in ./.mview\n    mview init catalog_product\n\n    # Use another data directory\n    mview --data-dir /var/lib/mview init catalog_product"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Setup",
        about = "Record changed entity ids",
        long_about = "Append one changelog record per id. Normally upstream hooks write the changelog.",
        after_help = "EXAMPLES:\n    # Record three changed products\n    mview record catalog_product 10 20 30"
    )]
    Record(cmd::record::RecordArgs),

    #[command(
        next_help_heading = "Update",
        about = "Run one incremental update pass",
        long_about = "Apply every entity changed since the last checkpoint, chunk by chunk. \
                      With --full the whole changelog is re-applied. \
                      Without --exec each chunk is printed as one line of ids. \
                      A pass stopped by a signal exits with status 75.",
        after_help = "EXAMPLES:\n    # Dry run: print chunks\n    mview update catalog_product\n\n    # Re-apply the whole changelog\n    mview update catalog_product --full\n\n    # Reindex each chunk with an external program\n    mview update catalog_product --exec ./reindex.sh --store default\n\n    # Emit machine-readable output\n    mview --json update catalog_product"
    )]
    Update(cmd::update::UpdateArgs),

    #[command(
        next_help_heading = "Read",
        about = "Show view status and lag",
        after_help = "EXAMPLES:\n    # All views\n    mview status\n\n    # One view as JSON\n    mview --json status catalog_product"
    )]
    Status(cmd::status::StatusArgs),

    #[command(
        next_help_heading = "Control",
        about = "Suspend a view",
        long_about = "Stop future passes. A running pass finishes and leaves the view suspended.",
        after_help = "EXAMPLES:\n    mview suspend catalog_product"
    )]
    Suspend(cmd::control::ViewArgs),

    #[command(
        next_help_heading = "Control",
        about = "Resume a suspended view",
        after_help = "EXAMPLES:\n    mview resume catalog_product"
    )]
    Resume(cmd::control::ViewArgs),

    #[command(
        next_help_heading = "Control",
        about = "Recover a view left working",
        long_about = "Set a view stuck in `working` back to idle after its process died. Suspended views stay suspended.",
        after_help = "EXAMPLES:\n    mview restore catalog_product"
    )]
    Restore(cmd::control::ViewArgs),

    #[command(
        next_help_heading = "Control",
        about = "Move an idle view's checkpoint",
        after_help = "EXAMPLES:\n    # Re-materialize everything on the next update\n    mview reset catalog_product\n\n    # Skip to version 500\n    mview reset catalog_product --version 500"
    )]
    Reset(cmd::control::ResetArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("MVIEW_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "mview_core=debug,mview=debug,info"
        } else {
            "mview_core=info,warn"
        })
    });

    let format = env::var("MVIEW_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    // Logs go to stderr so stdout stays parseable.
    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let output = cli.output_mode();
    let data_dir = cli.data_dir();
    debug!(data_dir = %data_dir.root().display(), "resolved data directory");

    let done = match &cli.command {
        Commands::Update(args) => return cmd::update::run_update(args, &data_dir, output),
        Commands::Init(args) => cmd::init::run_init(args, &data_dir, output),
        Commands::Record(args) => cmd::record::run_record(args, &data_dir, output),
        Commands::Status(args) => cmd::status::run_status(args, &data_dir, output),
        Commands::Suspend(args) => {
            cmd::control::run_control(Control::Suspend, &args.view, &data_dir, output)
        }
        Commands::Resume(args) => {
            cmd::control::run_control(Control::Resume, &args.view, &data_dir, output)
        }
        Commands::Restore(args) => {
            cmd::control::run_control(Control::Restore, &args.view, &data_dir, output)
        }
        Commands::Reset(args) => cmd::control::run_control(
            Control::Reset(args.version),
            &args.view,
            &data_dir,
            output,
        ),
    };
    done.map(|()| ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            let cli_error = CliError::from_anyhow(&err);
            if output::render_error(cli.output_mode(), &cli_error).is_err() {
                eprintln!("error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}
