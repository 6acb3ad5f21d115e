//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use errata_core::{Errata, Progress, RunOptions, RunOutcome};
use errata_oracle::{MockOracle, Oracle, OracleClient};
use errata_shared::{ExperimentId, config_file_path, init_config, load_config, validate_api_key};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Errata — map where your models fail.
#[derive(Parser)]
#[command(
    name = "errata",
    version,
    about = "Build a hierarchical taxonomy of model errors from scored evaluation records.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the full analysis pipeline.
    Run {
        /// Dataset names to analyze (default: every CSV in the data dir).
        #[arg(long, num_args = 1..)]
        datasets: Vec<String>,

        /// Directory holding `{dataset}.csv` files.
        #[arg(long)]
        data_dir: Option<String>,

        /// Directory for cached stage outputs and artifacts.
        #[arg(long)]
        output_dir: Option<String>,

        /// Only analyze failures from these models.
        #[arg(long, num_args = 1..)]
        models: Option<Vec<String>>,

        /// Fraction of failures sampled for analysis.
        #[arg(long)]
        ratio: Option<f64>,

        /// Seed for shuffling and sampling.
        #[arg(long)]
        seed: Option<u64>,

        /// Experiment id (default: generated). Reusing an id replays cached
        /// stages instead of calling the oracle.
        #[arg(long)]
        exp_id: Option<String>,

        /// Maximum simultaneously in-flight oracle calls.
        #[arg(long)]
        max_workers: Option<usize>,

        /// Judge model identifier.
        #[arg(long)]
        judge: Option<String>,

        /// Maximum taxonomy recursion depth.
        #[arg(long)]
        max_depth: Option<usize>,

        /// Collapse categories below this record share into "Other".
        #[arg(long)]
        rare_freq: Option<f64>,

        /// Extra input columns to carry into the leaf export.
        #[arg(long, num_args = 1..)]
        keep_columns: Vec<String>,

        /// Use the offline judge instead of a live oracle endpoint.
        #[arg(long)]
        mock: bool,

        /// Do not include correct outputs from other models in prompts.
        #[arg(long)]
        no_correct_refs: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "errata=info",
        1 => "errata=debug",
        _ => "errata=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command routing
// ---------------------------------------------------------------------------

/// Execute the parsed command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            datasets,
            data_dir,
            output_dir,
            models,
            ratio,
            seed,
            exp_id,
            max_workers,
            judge,
            max_depth,
            rare_freq,
            keep_columns,
            mock,
            no_correct_refs,
        } => {
            let mut config = load_config()?;
            if let Some(data_dir) = data_dir {
                config.defaults.data_dir = data_dir;
            }
            if let Some(output_dir) = output_dir {
                config.defaults.output_dir = output_dir;
            }
            if let Some(max_workers) = max_workers {
                config.oracle.max_workers = max_workers;
            }
            if let Some(judge) = judge {
                config.oracle.model = judge;
            }

            let mut options = RunOptions::from_config(&config);
            options.datasets = datasets;
            options.models = models;
            options.extra_columns = keep_columns;
            options.use_correct_refs = !no_correct_refs;
            if let Some(ratio) = ratio {
                options.ratio = ratio;
            }
            if let Some(seed) = seed {
                options.seed = seed;
            }
            if let Some(max_depth) = max_depth {
                options.max_depth = max_depth;
            }
            if let Some(rare_freq) = rare_freq {
                options.rare_freq = rare_freq;
            }
            if let Some(exp_id) = exp_id {
                options.exp_id = ExperimentId::new(exp_id);
            }

            let oracle: Arc<dyn Oracle> = if mock {
                info!("using the offline judge");
                Arc::new(MockOracle::new())
            } else {
                validate_api_key(&config)?;
                Arc::new(OracleClient::new(config.oracle.clone())?)
            };

            let runner = Errata::new(config, options, oracle)?;
            let progress = CliProgress::new();
            let outcome = runner.run(&progress).await?;

            println!("Complete! Experiment: {}", outcome.exp_id);
            println!(
                "Records: {}, Errors analyzed: {}, Taxonomy leaves: {}",
                outcome.total_records,
                outcome.error_records,
                outcome.leaves.len()
            );
            Ok(())
        }

        Command::Config { action } => match action {
            ConfigAction::Init => {
                let path = init_config()?;
                println!("Created {}", path.display());
                Ok(())
            }
            ConfigAction::Show => {
                let config = load_config()?;
                println!("# {}", config_file_path()?.display());
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Progress rendering
// ---------------------------------------------------------------------------

/// Spinner-based progress display for interactive runs.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}").expect("static progress template"),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        Self { bar }
    }
}

impl Progress for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn done(&self, _outcome: &RunOutcome) {
        self.bar.finish_and_clear();
    }
}
