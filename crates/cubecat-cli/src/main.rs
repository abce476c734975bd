// cubecat-cli: command-line frontend for cubecat-core
// Argument parsing, configuration loading, logging setup, exit codes

use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use cubecat_core::config::markdown::render_markdown;
use cubecat_core::config::{config_schema, merge_values};
use cubecat_core::{Config, Error, FileObj};

/// Create or extend a chunked array cube from slice datasets.
///
/// The target cube is created from the first slice if it does not exist
/// and extended along the append dimension by each further slice. Every
/// slice is one crash-safe transaction.
#[derive(Debug, Parser)]
#[command(name = "cubecat", version, arg_required_else_help = false)]
struct Cli {
    /// Slice dataset paths or URIs
    #[arg(value_name = "SLICE")]
    slices: Vec<String>,

    /// Configuration file (TOML or JSON). If multiple are passed, they
    /// will be deeply merged into one.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: Vec<String>,

    /// Target cube path or URI. Overrides the 'target_dir'
    /// configuration field.
    #[arg(short = 't', long = "target", value_name = "PATH")]
    target: Option<String>,

    /// Destroy an existing cube and its lock before processing
    #[arg(long)]
    force_new: bool,

    /// Run without creating, changing, or deleting any files
    #[arg(long)]
    dry_run: bool,

    /// Include the debug representation of errors
    #[arg(long)]
    traceback: bool,

    /// Show the configuration schema and exit
    #[arg(long, value_name = "FORMAT")]
    help_config: Option<HelpConfigFormat>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HelpConfigFormat {
    Json,
    Md,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(format) = cli.help_config {
        return show_config_help(format);
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => return report_error(e, cli.traceback),
    };

    init_logging(&config);

    if cli.slices.is_empty() {
        println!("No slice datasets given.");
        return ExitCode::SUCCESS;
    }

    match cubecat_core::process_slices(cli.slices.clone(), config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report_error(e, cli.traceback),
    }
}

fn show_config_help(format: HelpConfigFormat) -> ExitCode {
    let schema = config_schema();
    match format {
        HelpConfigFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&schema).expect("schema serializes")
            );
        }
        HelpConfigFormat::Md => {
            print!("{}", render_markdown(&schema));
        }
    }
    ExitCode::SUCCESS
}

/// Merge configuration files and apply command-line overrides, then
/// validate the result.
fn load_config(cli: &Cli) -> Result<Config, Error> {
    let files: Result<Vec<FileObj>, Error> = cli
        .config
        .iter()
        .map(|path| FileObj::new(path, None))
        .collect();
    let mut value = Config::value_from_files(&files?)?;

    let mut overrides = serde_json::Map::new();
    if let Some(target) = &cli.target {
        overrides.insert("target_dir".to_string(), serde_json::json!(target));
    }
    if cli.force_new {
        overrides.insert("force_new".to_string(), serde_json::json!(true));
    }
    if cli.dry_run {
        overrides.insert("dry_run".to_string(), serde_json::json!(true));
    }
    if !overrides.is_empty() {
        value = merge_values(value, serde_json::Value::Object(overrides));
    }

    Config::from_value(value)
}

/// Install the tracing subscriber: `RUST_LOG` wins, then the config's
/// `logging` level, then warnings only.
fn init_logging(config: &Config) {
    use tracing_subscriber::EnvFilter;

    let default_level = config
        .logging
        .as_ref()
        .map(|l| l.level().to_string())
        .unwrap_or_else(|| "warn".to_string());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn report_error(e: Error, traceback: bool) -> ExitCode {
    eprintln!("Error: {e}");
    if traceback {
        eprintln!("{e:#?}");
    }
    ExitCode::FAILURE
}
