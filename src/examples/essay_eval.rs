//! Essay Evaluation Example
//!
//! A three-stage pipeline over one essay:
//! - `segment_essay` splits the essay into embedded chunks
//! - `create_query` derives one query per chunk, linked back to it
//! - `evaluate` searches with each query and scores where its chunk ranked
//!
//! Stages run in dependency order through a [`Pipeline`]. Runs fully offline.
//!
//! Run with: cargo run --example essay_eval

use std::sync::Arc;
use vecflow_core::*;

const DIM: usize = 128;
const TOP_K: usize = 3;

const ESSAY: &str = "\
Most good ideas look bad at first. That is why so few people work on them. \
A startup is a company designed to grow fast. Growth is the one thing that defines it. \
The best way to get startup ideas is to notice problems in your own life. \
Writing forces you to think clearly. An essay that does not surprise its author is rarely worth reading. \
Cities send messages about what matters. Some tell you to be richer, others to be smarter. \
Taste can be learned by paying attention to what makes work good.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("vecflow Essay Evaluation Example\n");

    let registry = Arc::new(TableRegistry::new(EntityStore::in_memory().await?));
    registry
        .register([
            EntityType::builder("chunk")
                .primary_key("uid")
                .text("text")
                .vector("vector", DIM)
                .build()?,
            EntityType::builder("query")
                .primary_key("uid")
                .foreign_key("cid", "chunk")
                .text("text")
                .vector("vector", DIM)
                .build()?,
        ])
        .await?;

    let embedder: Arc<dyn Embedder> = Arc::new(CachedEmbedder::new(HashingEmbedder::new(DIM), 256));
    let segmenter: Arc<dyn Segmenter> = Arc::new(SentenceSegmenter::new()?);
    let searcher = Searcher::new(registry.clone());
    let evaluator = Arc::new(RankingEvaluator::new(TOP_K));
    let recall_key = evaluator.recall_key();

    let engine = InjectionEngine::new(registry.clone());

    let emb = embedder.clone();
    let segment_essay = engine
        .bind(
            Binding::new(
                "segment_essay",
                transform(Vec::<String>::new(), move |_| {
                    let segmenter = segmenter.clone();
                    let embedder = emb.clone();
                    async move {
                        let mut chunks = Vec::new();
                        for span in segmenter.segment(ESSAY, 120, 0)? {
                            chunks.push(
                                Entity::new("chunk")
                                    .with("vector", embedder.vectorize(&span).await?)
                                    .with("text", span),
                            );
                        }
                        Ok(Output::from(chunks))
                    }
                }),
            )
            .output("chunk"),
        )
        .await?;

    // Stand-in for a language model: the chunk's first sentence, reworded as a question
    let emb = embedder.clone();
    let create_query = engine
        .bind(
            Binding::new(
                "create_query",
                transform(["uid", "text"], move |args: Args| {
                    let embedder = emb.clone();
                    async move {
                        let text = args.text("text")?;
                        let first = text.split(". ").next().unwrap_or(text);
                        let query = format!("why {}?", first.trim_end_matches('.').to_lowercase());
                        Ok(Output::from(
                            Entity::new("query")
                                .with("cid", args.integer("uid")?)
                                .with("vector", embedder.vectorize_query(&query).await?)
                                .with("text", query),
                        ))
                    }
                }),
            )
            .input("chunk")
            .output("query"),
        )
        .await?;

    let evaluate = engine
        .bind(
            Binding::new(
                "evaluate",
                transform(["cid", "vector"], move |args: Args| {
                    let searcher = searcher.clone();
                    let evaluator = evaluator.clone();
                    async move {
                        let hits = searcher
                            .search_by_vector("chunk", args.vector("vector")?, TOP_K)
                            .await?;
                        let retrieved: Vec<i64> = hits.iter().filter_map(|h| h.entity.id).collect();
                        let metrics = evaluator.evaluate(args.integer("cid")?, &retrieved).await?;
                        validate_metrics(&metrics)?;
                        Ok(Output::from(serde_json::to_value(metrics)?))
                    }
                }),
            )
            .input("query"),
        )
        .await?;

    // Declared in reverse; the pipeline sorts them
    let pipeline = Pipeline::new()
        .with_stage(evaluate)
        .with_stage(create_query)
        .with_stage(segment_essay);

    for (stage, invocation) in pipeline.run().await? {
        println!(
            "▶ {}: {} units, {} rows",
            stage,
            invocation.processed,
            invocation.entities.len()
        );

        if stage == "evaluate" && !invocation.values.is_empty() {
            let n = invocation.values.len() as f64;
            let mean = |key: &str| {
                invocation
                    .values
                    .iter()
                    .filter_map(|v| v[key].as_f64())
                    .sum::<f64>()
                    / n
            };
            println!("\n📊 Over {} queries:", invocation.values.len());
            println!("   map       {:.3}", mean("map"));
            println!("   ndcg      {:.3}", mean("ndcg"));
            println!("   recall@{}  {:.3}", TOP_K, mean(&recall_key));
        }
    }

    Ok(())
}
