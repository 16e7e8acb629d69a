//! vecflow Core Library
//!
//! This crate provides the core functionality for vecflow, including:
//! - Typed entity schemas persisted in SQLite
//! - Table registry and entity store
//! - Injection engine binding transforms to source and sink types
//! - Pipeline ordering over the type graph
//! - Vector, keyword and hybrid merge-rerank search
//! - Collaborators: fetching, extraction, segmenting, embedding, reranking, evaluation

pub mod cache;
pub mod chunking;
pub mod config;
pub mod embedder;
pub mod entity;
pub mod error;
pub mod evaluate;
pub mod extract;
pub mod fetch;
pub mod hybrid;
pub mod inject;
pub mod pipeline;
pub mod registry;
pub mod rerank;
pub mod schema;
pub mod search;
pub mod store;

// Re-export commonly used types
pub use cache::CachedEmbedder;
pub use chunking::{Segmenter, SentenceSegmenter, TokenSegmenter};
pub use config::Config;
pub use embedder::{Embedder, HashingEmbedder, HttpEmbedder};
pub use entity::{Entity, Value};
pub use error::{Error, Result};
pub use evaluate::{validate_metrics, Evaluator, Metrics, RankingEvaluator};
pub use extract::{Extractor, HtmlExtractor};
pub use fetch::{FetchError, Fetcher, HttpFetcher, StaticFetcher};
pub use hybrid::HybridSearcher;
pub use inject::{transform, Args, Binding, InjectionEngine, Invocation, Output, Stage, Transform};
pub use pipeline::Pipeline;
pub use registry::TableRegistry;
pub use rerank::{HttpReranker, PassthroughReranker, Reranker};
pub use schema::{EntityType, FieldKind};
pub use search::{ScoredEntity, SearchResult, Searcher};
pub use store::EntityStore;
