//! Hybrid Search Example
//!
//! Loads two pages into a Document table, splits them into embedded,
//! keyword-indexed chunks, then merges keyword and vector hits and reranks
//! them with a small term-overlap reranker. Runs fully offline.
//!
//! Run with: cargo run --example hybrid_search

use std::collections::HashSet;
use std::sync::Arc;
use vecflow_core::*;

const DIM: usize = 64;

const PAGES: &[(&str, &str)] = &[
    (
        "smart",
        "<html><body><h1>Being smart</h1>\
         <p>Smart people are curious about many things. They notice what others miss.</p>\
         <p>Intelligence is less useful than curiosity. A curious person keeps asking why.</p>\
         </body></html>",
    ),
    (
        "work",
        "<html><body><h1>Doing good work</h1>\
         <p>Good work comes from choosing the right problem. Most effort is wasted on the wrong one.</p>\
         <p>Great work needs long stretches of attention. Interruptions are expensive.</p>\
         </body></html>",
    ),
];

/// Orders candidates by how many query terms they contain
struct OverlapReranker;

#[async_trait::async_trait]
impl Reranker for OverlapReranker {
    async fn rerank(&self, query: &str, candidates: &[String]) -> anyhow::Result<Vec<usize>> {
        let terms: HashSet<String> = query.split_whitespace().map(str::to_lowercase).collect();
        let mut order: Vec<(usize, usize)> = candidates
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let hits = text
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| terms.contains(&w.to_lowercase()))
                    .count();
                (i, hits)
            })
            .collect();
        order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(order.into_iter().map(|(i, _)| i).collect())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("vecflow Hybrid Search Example\n");

    let registry = Arc::new(TableRegistry::new(EntityStore::in_memory().await?));
    registry
        .register([
            EntityType::builder("document")
                .primary_key("uid")
                .text("title")
                .text("text")
                .build()?,
            EntityType::builder("chunk")
                .primary_key("uid")
                .foreign_key("doc_id", "document")
                .text("text")
                .vector("vector", DIM)
                .keyword("keyword")
                .build()?,
        ])
        .await?;
    println!("✅ Registered document and chunk\n");

    let fetcher = PAGES
        .iter()
        .fold(StaticFetcher::new(), |f, (title, html)| {
            f.with_page(format!("mem://{title}"), *html)
        });
    let fetcher: Arc<dyn Fetcher> = Arc::new(fetcher);
    let extractor: Arc<dyn Extractor> = Arc::new(HtmlExtractor::new()?);
    let segmenter: Arc<dyn Segmenter> = Arc::new(SentenceSegmenter::new()?);
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(DIM));

    let engine = InjectionEngine::new(registry.clone());

    let load_document = engine
        .bind(
            Binding::new(
                "load_document",
                transform(["title"], move |args: Args| {
                    let fetcher = fetcher.clone();
                    let extractor = extractor.clone();
                    async move {
                        let title = args.text("title")?;
                        let raw = fetcher.fetch(&format!("mem://{title}")).await?;
                        Ok(Output::from(
                            Entity::new("document")
                                .with("title", title)
                                .with("text", extractor.extract(&raw)),
                        ))
                    }
                }),
            )
            .output("document"),
        )
        .await?;

    let chunk_embedder = embedder.clone();
    let chunk_document = engine
        .bind(
            Binding::new(
                "chunk_document",
                transform(["text"], move |args: Args| {
                    let segmenter = segmenter.clone();
                    let embedder = chunk_embedder.clone();
                    async move {
                        let mut chunks = Vec::new();
                        for span in segmenter.segment(args.text("text")?, 80, 0)? {
                            chunks.push(
                                Entity::new("chunk")
                                    .with("text", span.as_str())
                                    .with("vector", embedder.vectorize(&span).await?)
                                    .with_keyword("keyword", span),
                            );
                        }
                        Ok(Output::from(chunks))
                    }
                }),
            )
            .input("document")
            .output("chunk"),
        )
        .await?;

    for (title, _) in PAGES {
        load_document
            .invoke_with(Args::new().with("title", *title))
            .await?;
    }
    let chunks = chunk_document.invoke().await?;
    println!("📝 Stored {} chunks", chunks.entities.len());

    // A second run finds nothing left to do
    let again = chunk_document.invoke().await?;
    println!("   Re-run produced {} chunks\n", again.entities.len());

    let hybrid = HybridSearcher::new(Searcher::new(registry), Arc::new(OverlapReranker))
        .with_text_field("text");

    let query = "curious smart people";
    let vector = embedder.vectorize_query(query).await?;
    println!("🔍 Results for '{}':", query);
    for (i, chunk) in hybrid.search("chunk", query, &vector, 3).await?.iter().enumerate() {
        println!(
            "   {}. [doc {}] {}",
            i + 1,
            chunk.integer("doc_id")?,
            chunk.text("text")?
        );
    }

    Ok(())
}
