use anyhow::Result;
use clap::Parser;
use vecflow_cli::app::App;
use vecflow_cli::cli::{CliArgs, Command};
use vecflow_cli::telemetry;
use vecflow_core::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Keep the guard alive so buffered logs are flushed on exit
    let _guard = telemetry::init_telemetry("./logs", args.verbose)?;

    let config = Config::load_or_default(&args.config)?;
    tracing::info!("vecflow starting");
    tracing::info!("  Database: {}", config.database_path().display());
    tracing::info!(
        "  Embedding: {} ({} dims)",
        config.embedding.url.as_deref().unwrap_or("offline"),
        config.embedding.dimensions
    );
    tracing::info!(
        "  Rerank: {}",
        config.rerank.url.as_deref().unwrap_or("passthrough")
    );

    let app = App::open(config, args.embedding_api_key, args.rerank_api_key).await?;

    match args.command {
        Command::Ingest { titles } => {
            let report = app.ingest(&titles).await?;
            println!(
                "ingested {} documents, {} chunks",
                report.documents, report.chunks
            );
        }
        Command::Search { query, topk } => {
            for chunk in app.search(&query, topk).await? {
                let line = serde_json::json!({
                    "uid": chunk.id,
                    "doc_id": chunk.integer("doc_id")?,
                    "text": chunk.text("text")?,
                });
                println!("{}", line);
            }
        }
        Command::Status => {
            for (stage, pending) in app.status().await? {
                println!("{:<20} {}", stage, pending);
            }
        }
    }

    Ok(())
}
