//! rusty-pipeline CLI - maintenance commands for a local data bundle
//!
//! ## Example Usage
//!
//! ```bash
//! # Build or extend a named universe of liquid equities
//! rusty-pipeline universe-update liquid --start 2015-01-02 --min-price 5 --min-dollar-volume 1e7
//!
//! # Remove every cached term
//! rusty-pipeline cache-clear
//!
//! # Summarize the bundle
//! rusty-pipeline bundle-info --json
//! ```

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rusty_pipeline::config::EngineConfig;
use rusty_pipeline::context::BundleContext;
use rusty_pipeline::data::SessionBarReader;
use rusty_pipeline::pipeline::{
    Arithmetic, BooleanCombination, ElementOf, InfoClassifier, NotMissing, NumericComparison, PipelineHooks,
    PriceColumn, SimpleMovingAverage, SimplePipelineEngine, Term, TermCache,
};
use rusty_pipeline::types::parse_date;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;

/// rusty-pipeline: point-in-time factor pipelines over a local bundle
#[derive(Parser)]
#[command(name = "rusty-pipeline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Robert Fall")]
#[command(about = "Point-in-time factor pipelines over a local equity bundle", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write or extend a named universe from a liquidity screen
    UniverseUpdate {
        /// Universe name ([A-Za-z0-9_])
        #[arg(value_name = "NAME")]
        name: String,

        /// First session for a new universe (YYYY-MM-DD)
        #[arg(short = 's', long)]
        start: String,

        /// Last session (YYYY-MM-DD, default: last bar in the bundle)
        #[arg(short = 'e', long)]
        end: Option<String>,

        /// Minimum close price
        #[arg(long, default_value = "5.0")]
        min_price: f64,

        /// Minimum 20-session average dollar volume
        #[arg(long)]
        min_dollar_volume: Option<f64>,

        /// Restrict to these sectors (repeatable)
        #[arg(long = "sector")]
        sectors: Vec<String>,

        /// Restrict to these exchanges (repeatable)
        #[arg(long = "exchange")]
        exchanges: Vec<String>,

        /// Sessions per chunk (overrides the configuration)
        #[arg(long)]
        chunksize: Option<usize>,
    },

    /// Delete every cached term result
    CacheClear,

    /// Show what the bundle contains
    BundleInfo {
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Progress bar advanced once per finished chunk
struct ProgressHook {
    bar: ProgressBar,
}

impl PipelineHooks for ProgressHook {
    fn on_pipeline_start(&self, start: chrono::NaiveDate, end: chrono::NaiveDate, chunks: usize) {
        self.bar.set_length(chunks as u64);
        self.bar.set_position(0);
        self.bar.set_message(format!("{} → {}", start, end));
    }

    fn on_chunk_end(&self, _index: usize, _rows: usize) {
        self.bar.inc(1);
    }
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.verbose {
        "info"
    } else {
        "warn"
    }))
    .init();

    let result = EngineConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")
        .and_then(|config| run(cli, config));

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

fn run(cli: Cli, config: EngineConfig) -> Result<()> {
    if cli.verbose {
        println!("{} v{}", "rusty-pipeline".cyan().bold(), env!("CARGO_PKG_VERSION"));
        println!("Bundle: {}", config.bundle.root.display().to_string().dimmed());
    }

    match cli.command {
        Commands::UniverseUpdate {
            name,
            start,
            end,
            min_price,
            min_dollar_volume,
            sectors,
            exchanges,
            chunksize,
        } => universe_update(UniverseArgs {
            name,
            start,
            end,
            min_price,
            min_dollar_volume,
            sectors,
            exchanges,
            chunksize,
            config,
        }),
        Commands::CacheClear => cache_clear(&config),
        Commands::BundleInfo { json } => bundle_info(&config, json),
    }
}

struct UniverseArgs {
    name: String,
    start: String,
    end: Option<String>,
    min_price: f64,
    min_dollar_volume: Option<f64>,
    sectors: Vec<String>,
    exchanges: Vec<String>,
    chunksize: Option<usize>,
    config: EngineConfig,
}

fn build_screen(args: &UniverseArgs) -> Result<Arc<dyn Term>> {
    let close = PriceColumn::close();
    let mut filters: Vec<Arc<dyn Term>> = vec![
        Arc::new(NotMissing::new(close.clone())),
        NumericComparison::gt(close.clone(), args.min_price),
    ];
    if let Some(threshold) = args.min_dollar_volume {
        let dollar_volume = Arithmetic::mul(close, PriceColumn::volume());
        let average: Arc<dyn Term> = Arc::new(SimpleMovingAverage::new(dollar_volume, 20));
        filters.push(NumericComparison::gt(average, threshold));
    }
    if !args.sectors.is_empty() {
        let choices: Vec<&str> = args.sectors.iter().map(String::as_str).collect();
        filters.push(Arc::new(ElementOf::new(Arc::new(InfoClassifier::sector()), &choices)?));
    }
    if !args.exchanges.is_empty() {
        let choices: Vec<&str> = args.exchanges.iter().map(String::as_str).collect();
        filters.push(Arc::new(ElementOf::new(Arc::new(InfoClassifier::exchange()), &choices)?));
    }
    Ok(BooleanCombination::all(filters)?)
}

fn universe_update(args: UniverseArgs) -> Result<()> {
    let started = Instant::now();
    let screen = build_screen(&args)?;
    let default_start = parse_date(&args.start)?;

    let mut config = args.config.clone();
    if let Some(chunksize) = args.chunksize {
        config.pipeline.chunksize = chunksize;
    }
    config.ensure_dirs()?;

    let context = Arc::new(BundleContext::open(&config.bundle, &config.fundamentals)?);
    let end = match &args.end {
        Some(end) => parse_date(end)?,
        None => match context.bar_reader().last_available_dt()? {
            Some(last) => last,
            None => bail!("The bundle has no bars; pass --end explicitly"),
        },
    };

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} chunks {msg}")?
            .progress_chars("#>-"),
    );
    let engine = SimplePipelineEngine::from_config(context.clone(), &config)?
        .with_hook(Arc::new(ProgressHook { bar: bar.clone() }));

    let universes = context.universes()?;
    let written = universes
        .update_universe(&args.name, &engine, screen, default_start, end)
        .with_context(|| format!("Failed to update universe {}", args.name))?;
    bar.finish_and_clear();

    let last = universes.get_last_date(&args.name)?;
    println!(
        "{} {} rows written to {} (last date: {}) in {:.1}s",
        "✓".green().bold(),
        written,
        args.name.cyan(),
        last.map(|d| d.to_string()).unwrap_or_else(|| "none".to_string()),
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

fn cache_clear(config: &EngineConfig) -> Result<()> {
    if !config.cache.dir.exists() {
        println!("Cache directory {} does not exist", config.cache.dir.display());
        return Ok(());
    }
    let cache = TermCache::new(&config.cache.dir)?;
    let removed = cache.clear()?;
    println!(
        "{} removed {} cache entries from {}",
        "✓".green().bold(),
        removed,
        config.cache.dir.display()
    );
    Ok(())
}

fn bundle_info(config: &EngineConfig, json: bool) -> Result<()> {
    let context = BundleContext::open(&config.bundle, &config.fundamentals)?;
    let summary = context.summary()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("{}", "Bundle".cyan().bold());
    println!("  root:        {}", config.bundle.root.display());
    println!("  calendar:    {}", summary.calendar);
    println!("  equities:    {}", summary.equities);
    match (summary.first_bar, summary.last_bar) {
        (Some(first), Some(last)) => println!("  bars:        {} to {}", first, last),
        _ => println!("  bars:        {}", "none".yellow()),
    }
    println!("  adjustments: {}", if summary.adjustments { "yes" } else { "no" });
    if summary.universes.is_empty() {
        println!("  universes:   {}", "none".dimmed());
    } else {
        println!("  universes:   {}", summary.universes.join(", "));
    }
    println!("  data stamp:  {}", summary.data_stamp.dimmed());
    Ok(())
}
