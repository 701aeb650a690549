//! Embedstore - Embedding Store and Similarity Search
//!
//! CLI over a `SQLite` table of text records and their embeddings.

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use embedstore::cli::{Cli, Commands, GlobalArgs, NeighborCommands, OutputFormat};
use embedstore::config::{Config, FailurePolicy};
use embedstore::driver::{ChunkReport, DriverConfig, EmbeddingDriver, RunSummary};
use embedstore::formatter::{
    format_answer, format_hits, format_related, format_status, format_summary,
};
use embedstore::llm::{OpenAiGenerator, build_embedder};
use embedstore::rag::{Rag, related, related_to_term};
use embedstore::search::refresh_neighbor_cache;
use embedstore::store::Store;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    let mut config = Config::load(cli.global.config.as_deref())?;
    if let Some(db) = &cli.global.db {
        config.database = Some(db.clone());
    }
    let format = cli.global.format;

    match cli.command {
        Commands::Init => handle_init(&config),
        Commands::Status => handle_status(&config, format),
        Commands::Config => handle_config(&config, &cli.global),
        Commands::Embed {
            force,
            chunk_size,
            batch_size,
            limit,
            max_retries,
            abort_on_failure,
        } => {
            let mut driver = DriverConfig::from(&config.driver);
            if let Some(n) = chunk_size {
                driver.chunk_size = n;
            }
            if let Some(n) = batch_size {
                driver.batch_size = n;
            }
            if let Some(n) = max_retries {
                driver.max_retries = n;
            }
            if limit.is_some() {
                driver.limit = limit;
            }
            if abort_on_failure {
                driver.on_failure = FailurePolicy::Abort;
            }
            handle_embed(&config, driver, force, format)
        }
        Commands::Similar { id, limit } => handle_similar(&config, id, limit, format),
        Commands::Search { query, limit } => handle_search(&config, &query, limit, format),
        Commands::Related {
            term,
            matches,
            limit,
        } => handle_related(&config, &term, matches, limit, format),
        Commands::Ask { question, limit } => handle_ask(&config, &question, limit, format),
        Commands::Neighbors(cmd) => handle_neighbors(&config, cmd, format),
        Commands::Migrate { json_column } => handle_migrate(&config, &json_column),
    }
}

/// Log to stderr; stdout carries results.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn open_store(config: &Config) -> Result<Store> {
    let path = config.database_path()?;
    Ok(Store::open(&path, config.table.clone())?)
}

fn handle_init(config: &Config) -> Result<()> {
    let path = config.database_path()?;
    let store = Store::open(&path, config.table.clone())?;
    let status = store.status()?;
    println!(
        "{} Table '{}' ready in {}",
        "✓".green(),
        config.table.name,
        path.display()
    );
    println!("  {} records, {} pending", status.total, status.pending);
    Ok(())
}

fn handle_status(config: &Config, format: OutputFormat) -> Result<()> {
    let path = config.database_path()?;
    let store = Store::open(&path, config.table.clone())?;
    let status = store.status()?;
    println!(
        "{}",
        format_status(&status, &path.to_string_lossy(), format)?
    );
    Ok(())
}

fn handle_config(config: &Config, global: &GlobalArgs) -> Result<()> {
    if global.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }
    let source = global.config.clone().or_else(|| {
        embedstore::config::get_default_config_path().filter(|p| p.exists())
    });
    match source {
        Some(p) => println!("{}", format!("# {}", p.display()).dimmed()),
        None => println!("{}", "# defaults (no config file)".dimmed()),
    }
    print!("{}", config.to_yaml()?);
    Ok(())
}

fn handle_embed(
    config: &Config,
    driver_config: DriverConfig,
    force: bool,
    format: OutputFormat,
) -> Result<()> {
    let store = open_store(config)?;
    // A bad provider config must fail before --force drops any vector.
    let provider = build_embedder(&config.embedding)?;

    if force {
        let cleared = store.clear_vectors()?;
        eprintln!("Cleared {cleared} existing embeddings");
    }

    let pending = store.count_pending()?;
    if pending == 0 {
        if format == OutputFormat::Json {
            let summary = RunSummary::empty(provider.model());
            println!("{}", format_summary(&summary, format)?);
        } else {
            println!("{} All records already have embeddings.", "✓".green());
        }
        return Ok(());
    }
    let total = driver_config.limit.map_or(pending, |l| l.min(pending));

    eprintln!(
        "Embedding {total} records with {} (chunks of {}, batches of {})",
        provider.model(),
        driver_config.chunk_size,
        driver_config.batch_size
    );

    let progress = if format == OutputFormat::Json {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(total as u64)
    };
    progress.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )?
        .progress_chars("#>-"),
    );

    let summary = {
        let bar = progress.clone();
        let mut failed = 0usize;
        let mut driver = EmbeddingDriver::new(&store, provider.as_ref(), driver_config)?
            .with_observer(move |report: &ChunkReport| {
                failed += report.failed;
                bar.inc(report.attempted as u64);
                if failed > 0 {
                    bar.set_message(format!("{failed} failed"));
                }
            });
        driver.run()?
    };
    progress.finish_and_clear();

    println!("{}", format_summary(&summary, format)?);

    if let Err(e) = summary.into_result() {
        eprintln!("{} {e}", "Error:".red());
        std::process::exit(1);
    }
    Ok(())
}

fn handle_similar(config: &Config, id: i64, limit: usize, format: OutputFormat) -> Result<()> {
    let store = open_store(config)?;
    let hits = related(&store, id, limit)?;
    println!("{}", format_hits(&hits, format)?);
    Ok(())
}

fn handle_search(config: &Config, query: &str, limit: usize, format: OutputFormat) -> Result<()> {
    let store = open_store(config)?;
    let provider = build_embedder(&config.embedding)?;
    let hits = Rag::new(&store, provider.as_ref()).search(query, limit)?;
    println!("{}", format_hits(&hits, format)?);
    Ok(())
}

fn handle_related(
    config: &Config,
    term: &str,
    matches: usize,
    limit: usize,
    format: OutputFormat,
) -> Result<()> {
    let store = open_store(config)?;
    let found = related_to_term(&store, term, matches, limit)?;
    println!("{}", format_related(&found, format)?);
    Ok(())
}

fn handle_ask(config: &Config, question: &str, limit: usize, format: OutputFormat) -> Result<()> {
    let store = open_store(config)?;
    let provider = build_embedder(&config.embedding)?;
    let generator = OpenAiGenerator::new(&config.generation)?;

    if format == OutputFormat::Text {
        eprintln!("{}", format!("Asking {}...", config.generation.model).dimmed());
    }
    let answer = Rag::new(&store, provider.as_ref()).ask(&generator, question, limit)?;
    println!("{}", format_answer(&answer, format)?);
    Ok(())
}

fn handle_neighbors(config: &Config, cmd: NeighborCommands, format: OutputFormat) -> Result<()> {
    let store = open_store(config)?;
    if config.table.neighbors_column.is_none() {
        eprintln!(
            "{} No neighbors column configured. Set table.neighbors_column in the config.",
            "Error:".red()
        );
        std::process::exit(1);
    }

    match cmd {
        NeighborCommands::Refresh { limit } => {
            let written = refresh_neighbor_cache(&store, limit)?;
            println!(
                "{} Cached {limit} neighbors for {written} records",
                "✓".green()
            );
        }
        NeighborCommands::Show { id } => match store.neighbors(id)? {
            Some(ids) => {
                if format == OutputFormat::Json {
                    println!("{}", serde_json::to_string_pretty(&ids)?);
                } else {
                    let list: Vec<String> = ids.iter().map(ToString::to_string).collect();
                    println!("{} {}", format!("#{id}").cyan(), list.join(", "));
                }
            }
            None => {
                println!(
                    "{}",
                    format!("No cached neighbors for #{id}. Run 'embedstore neighbors refresh'.")
                        .dimmed()
                );
            }
        },
    }
    Ok(())
}

fn handle_migrate(config: &Config, json_column: &str) -> Result<()> {
    let store = open_store(config)?;
    let converted = store.migrate_json_vectors(json_column)?;
    println!(
        "{} Converted {converted} vectors from '{json_column}' into '{}'",
        "✓".green(),
        config.table.vector_column
    );
    Ok(())
}
