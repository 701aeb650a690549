//! Command-line interface definitions.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Embedding store: batch-embed table rows and query them by similarity.
#[derive(Debug, Parser)]
#[command(name = "embedstore", author, version, about, long_about = None)]
pub struct Cli {
    /// Global options.
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand.
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Config file (YAML).
    #[arg(long, global = true, env = "EMBEDSTORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database path, overriding the config file.
    #[arg(long, global = true, env = "EMBEDSTORE_DB")]
    pub db: Option<PathBuf>,

    /// Verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// JSON.
    Json,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create the table and vector columns if missing.
    Init,

    /// Show record counts and the vector dimension.
    Status,

    /// Print the effective configuration.
    Config,

    /// Embed every record that has no vector yet.
    Embed {
        /// Clear all vectors first and re-embed everything.
        #[arg(long)]
        force: bool,

        /// Records per commit.
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Records per provider call.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Maximum records to process in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Retries per failed batch.
        #[arg(long)]
        max_retries: Option<u32>,

        /// Stop at the first batch that still fails after retries.
        #[arg(long)]
        abort_on_failure: bool,
    },

    /// Records most similar to a stored record.
    Similar {
        /// Record id.
        id: i64,

        /// Number of results.
        #[arg(short = 'n', long, default_value_t = 5)]
        limit: usize,
    },

    /// Records most similar to free text.
    Search {
        /// Query text.
        query: String,

        /// Number of results.
        #[arg(short = 'n', long, default_value_t = 5)]
        limit: usize,
    },

    /// Find records containing a word, then their nearest neighbors.
    Related {
        /// Word or phrase to look for.
        term: String,

        /// Maximum matching records.
        #[arg(long, default_value_t = 5)]
        matches: usize,

        /// Neighbors per match.
        #[arg(short = 'n', long, default_value_t = 1)]
        limit: usize,
    },

    /// Answer a question from the most relevant records.
    Ask {
        /// Question.
        question: String,

        /// Records used as context.
        #[arg(short = 'n', long, default_value_t = 5)]
        limit: usize,
    },

    /// Cached neighbor lists.
    #[command(subcommand)]
    Neighbors(NeighborCommands),

    /// Convert a column of JSON float lists into the vector column.
    Migrate {
        /// Column holding JSON-encoded vectors.
        json_column: String,
    },
}

/// Neighbor cache subcommands.
#[derive(Debug, Subcommand)]
pub enum NeighborCommands {
    /// Recompute the neighbor list of every embedded record.
    Refresh {
        /// Neighbors per record.
        #[arg(short = 'n', long, default_value_t = 5)]
        limit: usize,
    },

    /// Show the cached neighbor list of a record.
    Show {
        /// Record id.
        id: i64,
    },
}
