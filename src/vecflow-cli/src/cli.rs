//! CLI argument parsing and command definitions.

use clap::{Parser, Subcommand};

/// Ingest documents into a hybrid index and search them.
#[derive(Parser, Debug)]
#[command(name = "vecflow", author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file.
    #[arg(short, long, env = "VECFLOW_CONFIG", default_value = "config.json")]
    pub config: String,

    /// API key for the embedding service.
    #[arg(long, env = "VECFLOW_EMBEDDING_API_KEY", hide_env_values = true)]
    pub embedding_api_key: Option<String>,

    /// API key for the rerank service.
    #[arg(long, env = "VECFLOW_RERANK_API_KEY", hide_env_values = true)]
    pub rerank_api_key: Option<String>,

    /// More log output; repeat for trace level. Ignored when RUST_LOG is set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch documents by title, then split and embed every unprocessed document.
    Ingest {
        /// Document titles, substituted into the configured source URL.
        #[arg(required = true)]
        titles: Vec<String>,
    },

    /// Hybrid keyword + vector search over chunks, reranked.
    Search {
        /// Query text.
        query: String,

        /// Number of chunks to return.
        #[arg(short, long, default_value_t = 3)]
        topk: usize,
    },

    /// Show unprocessed rows per stage.
    Status,
}
