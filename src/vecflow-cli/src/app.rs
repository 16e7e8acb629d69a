//! Document → chunk hybrid index wiring.
//!
//! `load_document` fetches a page by title and stores its plain text;
//! `chunk_document` splits every unprocessed document into token windows,
//! embeds each window and stores it with a keyword index.

use anyhow::{Context, Result};
use std::sync::Arc;
use vecflow_core::{
    transform, Args, Binding, CachedEmbedder, Config, Embedder, Entity, EntityStore, EntityType,
    Extractor, Fetcher, HashingEmbedder, HtmlExtractor, HttpEmbedder, HttpFetcher, HttpReranker,
    HybridSearcher, InjectionEngine, Output, PassthroughReranker, Pipeline, Reranker, Searcher,
    Segmenter, Stage, TableRegistry, TokenSegmenter,
};

pub const DOCUMENT: &str = "document";
pub const CHUNK: &str = "chunk";

pub fn document_type() -> vecflow_core::Result<EntityType> {
    EntityType::builder(DOCUMENT)
        .primary_key("uid")
        .text("title")
        .text("text")
        .build()
}

pub fn chunk_type(dimensions: usize) -> vecflow_core::Result<EntityType> {
    EntityType::builder(CHUNK)
        .primary_key("uid")
        .foreign_key("doc_id", DOCUMENT)
        .text("text")
        .vector("vector", dimensions)
        .keyword("keyword")
        .build()
}

/// External services the pipeline calls
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub extractor: Arc<dyn Extractor>,
    pub segmenter: Arc<dyn Segmenter>,
    pub embedder: Arc<dyn Embedder>,
    pub reranker: Arc<dyn Reranker>,
}

impl Collaborators {
    /// Services named by `config`; offline fallbacks where no URL is set
    pub fn from_config(
        config: &Config,
        embedding_api_key: Option<String>,
        rerank_api_key: Option<String>,
    ) -> Result<Self> {
        let timeout = config.fetch_timeout();
        let capacity = config.embedding.cache_capacity;

        let embedder: Arc<dyn Embedder> = match &config.embedding.url {
            Some(url) => {
                let http = HttpEmbedder::new(
                    url.clone(),
                    config.embedding.model.clone(),
                    config.embedding.dimensions,
                    timeout,
                )?
                .with_api_key(embedding_api_key);
                Arc::new(CachedEmbedder::new(http, capacity))
            }
            None => {
                tracing::warn!("No embedding service configured, using the hashing embedder");
                Arc::new(CachedEmbedder::new(
                    HashingEmbedder::new(config.embedding.dimensions),
                    capacity,
                ))
            }
        };

        let reranker: Arc<dyn Reranker> = match &config.rerank.url {
            Some(url) => Arc::new(
                HttpReranker::new(url.clone(), config.rerank.model.clone(), timeout)?
                    .with_api_key(rerank_api_key),
            ),
            None => Arc::new(PassthroughReranker),
        };

        Ok(Self {
            fetcher: Arc::new(HttpFetcher::new(timeout)?),
            extractor: Arc::new(HtmlExtractor::new()?),
            segmenter: Arc::new(TokenSegmenter::new()?),
            embedder,
            reranker,
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub documents: usize,
    pub chunks: usize,
}

pub struct App {
    config: Config,
    load: Stage,
    chunk: Stage,
    pipeline: Pipeline,
    embedder: Arc<dyn Embedder>,
    hybrid: HybridSearcher,
}

impl App {
    /// Open the configured database and wire the stages
    pub async fn open(
        config: Config,
        embedding_api_key: Option<String>,
        rerank_api_key: Option<String>,
    ) -> Result<Self> {
        let store = EntityStore::open(config.database_path())
            .await
            .context("Failed to open database")?;
        let collaborators = Collaborators::from_config(&config, embedding_api_key, rerank_api_key)?;
        Self::new(config, store, collaborators).await
    }

    pub async fn new(config: Config, store: EntityStore, collaborators: Collaborators) -> Result<Self> {
        let registry = Arc::new(TableRegistry::new(store));
        registry
            .register([document_type()?, chunk_type(config.embedding.dimensions)?])
            .await?;

        let engine =
            InjectionEngine::new(registry.clone()).with_row_timeout(config.row_timeout());

        let load = engine
            .bind(Binding::new("load_document", load_document(&config, &collaborators)).output(DOCUMENT))
            .await?;
        let chunk = engine
            .bind(
                Binding::new("chunk_document", chunk_document(&config, &collaborators))
                    .input(DOCUMENT)
                    .output(CHUNK),
            )
            .await?;

        let pipeline = Pipeline::new().with_stage(load.clone()).with_stage(chunk.clone());
        let hybrid = HybridSearcher::new(Searcher::new(registry), collaborators.reranker.clone())
            .with_text_field("text");

        Ok(Self {
            config,
            load,
            chunk,
            pipeline,
            embedder: collaborators.embedder,
            hybrid,
        })
    }

    /// Load each title, then chunk every document not chunked yet
    pub async fn ingest(&self, titles: &[String]) -> Result<IngestReport> {
        let mut report = IngestReport::default();

        for title in titles {
            let loaded = self
                .load
                .invoke_with(Args::new().with("title", title.as_str()))
                .await
                .with_context(|| format!("Failed to load `{}`", title))?;
            report.documents += loaded.entities.len();
        }

        let chunked = if self.config.concurrency > 1 {
            self.chunk.invoke_concurrent(self.config.concurrency).await?
        } else {
            self.chunk.invoke().await?
        };
        report.chunks = chunked.entities.len();

        tracing::info!(
            "Ingested {} documents into {} chunks",
            report.documents,
            report.chunks
        );
        Ok(report)
    }

    /// Hybrid search over chunks
    pub async fn search(&self, query: &str, topk: usize) -> Result<Vec<Entity>> {
        let vector = self
            .embedder
            .vectorize_query(query)
            .await
            .context("Failed to embed query")?;
        Ok(self.hybrid.search(CHUNK, query, &vector, topk).await?)
    }

    /// Pending source rows per stage
    pub async fn status(&self) -> Result<Vec<(String, usize)>> {
        Ok(self.pipeline.status().await?)
    }
}

fn load_document(config: &Config, collaborators: &Collaborators) -> impl vecflow_core::Transform {
    let config = Arc::new(config.clone());
    let fetcher = collaborators.fetcher.clone();
    let extractor = collaborators.extractor.clone();

    transform(["title"], move |args: Args| {
        let config = config.clone();
        let fetcher = fetcher.clone();
        let extractor = extractor.clone();
        async move {
            let title = args.text("title")?;
            let url = config.source_url(title);
            let raw = fetcher
                .fetch(&url)
                .await
                .with_context(|| format!("Failed to fetch the document `{}`", title))?;

            Ok(Output::from(
                Entity::new(DOCUMENT)
                    .with("title", title)
                    .with("text", extractor.extract(&raw)),
            ))
        }
    })
}

fn chunk_document(config: &Config, collaborators: &Collaborators) -> impl vecflow_core::Transform {
    let (size, overlap) = (config.chunking.size, config.chunking.overlap);
    let segmenter = collaborators.segmenter.clone();
    let embedder = collaborators.embedder.clone();

    transform(["uid", "text"], move |args: Args| {
        let segmenter = segmenter.clone();
        let embedder = embedder.clone();
        async move {
            let spans = segmenter.segment(args.text("text")?, size, overlap)?;

            let mut chunks = Vec::with_capacity(spans.len());
            for span in spans {
                let vector = embedder.vectorize(&span).await?;
                chunks.push(
                    Entity::new(CHUNK)
                        .with("doc_id", args.integer("uid")?)
                        .with("text", span.as_str())
                        .with("vector", vector)
                        .with_keyword("keyword", span),
                );
            }
            Ok(Output::from(chunks))
        }
    })
}
