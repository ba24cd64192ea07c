//! petreg: harvest pet registration statistics and write them to disk.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use petreg::{
    Category, EventSink, FallbackSynthesizer, FanoutSink, HarvestConfig, Harvester, QueryShape,
    TracingSink, YearOrder,
};
use petreg_cli::output::{write_all, OutputPaths, DEFAULT_JS_VAR};
use petreg_cli::RunJournal;

#[derive(Parser)]
#[command(
    name = "petreg",
    about = "Harvest pet registration statistics with session handling, retries and synthetic fallback",
    version
)]
struct Cli {
    /// Path to a JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Query the source and write the outputs (default).
    Harvest(HarvestArgs),

    /// Write a synthetic dataset without contacting the source.
    Synth(SynthArgs),

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   petreg completions bash > ~/.local/share/bash-completion/completions/petreg
    ///   petreg completions zsh > ~/.zfunc/_petreg
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OrderArg {
    Asc,
    Desc,
}

#[derive(Clone, Copy, ValueEnum)]
enum ShapeArg {
    Form,
    Service,
}

#[derive(Args, Default)]
struct OutputArgs {
    /// Root directory for data/ and public/js/.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Variable name in the script document.
    #[arg(long, default_value = DEFAULT_JS_VAR)]
    js_var: String,
}

#[derive(Args, Default)]
struct HarvestArgs {
    /// First year to query.
    #[arg(long)]
    start_year: Option<i32>,

    /// Last year to query (default: current year).
    #[arg(long)]
    end_year: Option<i32>,

    /// Categories to query (repeatable: dog, cat).
    #[arg(long = "category")]
    categories: Vec<Category>,

    /// Year order.
    #[arg(long, value_enum)]
    order: Option<OrderArg>,

    /// Request shape.
    #[arg(long, value_enum)]
    shape: Option<ShapeArg>,

    /// Lower pacing bound between keys, in milliseconds.
    #[arg(long)]
    min_delay_ms: Option<u64>,

    /// Upper pacing bound between keys, in milliseconds.
    #[arg(long)]
    max_delay_ms: Option<u64>,

    /// Attempts per key.
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Base retry delay, in milliseconds.
    #[arg(long)]
    base_delay_ms: Option<u64>,

    /// Force a session refresh every N keys (0 disables).
    #[arg(long)]
    refresh_every: Option<u32>,

    /// Fetch decoy pages before each query.
    #[arg(long)]
    decoys: bool,

    /// Return an empty dataset instead of synthesizing one.
    #[arg(long)]
    no_synthesis: bool,

    /// Seed for pacing jitter and synthesis.
    #[arg(long)]
    seed: Option<u64>,

    /// Append run events to this JSONL file.
    #[arg(long)]
    journal: Option<PathBuf>,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct SynthArgs {
    #[arg(long, default_value_t = 2020)]
    start_year: i32,

    #[arg(long)]
    end_year: Option<i32>,

    /// Categories to generate (repeatable: dog, cat).
    #[arg(long = "category")]
    categories: Vec<Category>,

    /// Regions to generate (repeatable; default: all 22).
    #[arg(long = "region")]
    regions: Vec<String>,

    #[arg(long)]
    seed: Option<u64>,

    #[command(flatten)]
    output: OutputArgs,
}

impl HarvestArgs {
    /// Flags override file and environment settings.
    fn apply(&self, config: &mut HarvestConfig) {
        if let Some(v) = self.start_year {
            config.start_year = v;
        }
        if self.end_year.is_some() {
            config.end_year = self.end_year;
        }
        if !self.categories.is_empty() {
            config.categories = self.categories.clone();
        }
        if let Some(order) = self.order {
            config.order = match order {
                OrderArg::Asc => YearOrder::Ascending,
                OrderArg::Desc => YearOrder::Descending,
            };
        }
        if let Some(shape) = self.shape {
            config.source.query_shape = match shape {
                ShapeArg::Form => QueryShape::Form,
                ShapeArg::Service => QueryShape::Service,
            };
        }
        if let Some(v) = self.min_delay_ms {
            config.pacing.min_ms = v;
        }
        if let Some(v) = self.max_delay_ms {
            config.pacing.max_ms = v;
        }
        if let Some(v) = self.max_attempts {
            config.retry.max_attempts = v;
        }
        if let Some(v) = self.base_delay_ms {
            config.retry.base_delay_ms = v;
        }
        if let Some(v) = self.refresh_every {
            config.session_refresh_every = v;
        }
        if self.decoys {
            config.decoy.enabled = true;
        }
        if self.no_synthesis {
            config.synthesis.enabled = false;
        }
        if self.seed.is_some() {
            config.synthesis.seed = self.seed;
        }
    }
}

async fn harvest(config_path: Option<&str>, args: HarvestArgs) -> anyhow::Result<()> {
    let mut config = HarvestConfig::resolve(config_path)?;
    args.apply(&mut config);
    config.validate()?;

    let mut sink = FanoutSink::new().with(Arc::new(TracingSink));
    if let Some(path) = &args.journal {
        let journal = RunJournal::open(path)?;
        tracing::info!("Journal: {}", journal.path().display());
        sink = sink.with(Arc::new(journal));
    }
    let sink: Arc<dyn EventSink> = Arc::new(sink);

    tracing::info!(
        "Harvesting {}..={} for {:?}",
        config.start_year,
        config.resolved_end_year(),
        config.categories
    );
    let mut harvester = Harvester::from_config(config)?.with_sink(sink);
    if let Some(seed) = args.seed {
        harvester = harvester.with_seed(seed);
    }
    let dataset = harvester.run().await;

    if dataset.is_empty() {
        tracing::warn!("No records acquired");
        if let Some(error) = dataset.error() {
            tracing::error!("{error}");
        }
        return Ok(());
    }

    if dataset.is_synthetic() {
        tracing::warn!(
            "Source unavailable, wrote {} SYNTHETIC records",
            dataset.len()
        );
    } else {
        tracing::info!("Acquired {} records", dataset.len());
    }
    let paths = OutputPaths::under(&args.output.out_dir);
    write_all(&dataset, &paths, &args.output.js_var)
}

fn synth(config_path: Option<&str>, args: SynthArgs) -> anyhow::Result<()> {
    let config = HarvestConfig::resolve(config_path)?;
    let end_year = args.end_year.unwrap_or_else(|| config.resolved_end_year());
    anyhow::ensure!(
        args.start_year <= end_year,
        "start year {} is after end year {end_year}",
        args.start_year
    );
    let categories = if args.categories.is_empty() {
        config.categories.clone()
    } else {
        args.categories
    };
    let regions = if args.regions.is_empty() {
        config.synthesis.regions.clone()
    } else {
        args.regions
    };

    let dataset = FallbackSynthesizer::new(args.seed.or(config.synthesis.seed)).generate(
        args.start_year,
        end_year,
        &regions,
        &categories,
    );
    tracing::info!("Generated {} synthetic records", dataset.len());
    write_all(
        &dataset,
        &OutputPaths::under(&args.output.out_dir),
        &args.output.js_var,
    )
    .context("failed to write synthetic outputs")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or_else(|| {
        Commands::Harvest(HarvestArgs {
            output: OutputArgs {
                out_dir: PathBuf::from("."),
                js_var: DEFAULT_JS_VAR.to_string(),
            },
            ..HarvestArgs::default()
        })
    }) {
        Commands::Harvest(args) => harvest(cli.config.as_deref(), args).await?,
        Commands::Synth(args) => synth(cli.config.as_deref(), args)?,
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "petreg", &mut std::io::stdout());
        }
    }

    Ok(())
}
