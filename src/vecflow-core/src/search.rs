use rayon::prelude::*;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::registry::TableRegistry;

/// A row and its adapter-specific score (higher is better)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredEntity {
    pub entity: Entity,
    pub score: f64,
}

/// Ordered search hits. Scores from different adapters are not comparable.
pub type SearchResult = Vec<ScoredEntity>;

/// Vector and keyword search over registered entity types
#[derive(Clone)]
pub struct Searcher {
    registry: Arc<TableRegistry>,
}

impl Searcher {
    pub fn new(registry: Arc<TableRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    /// Top `topk` rows by cosine similarity, descending, ties by ascending identity
    pub async fn search_by_vector(
        &self,
        table: &str,
        vector: &[f32],
        topk: usize,
    ) -> Result<SearchResult> {
        let ty = self.registry.get(table).await?;
        check_topk(topk)?;

        let (field, dim) = ty.vector_field().ok_or_else(|| Error::UnsupportedSearch {
            table: table.to_string(),
            kind: "vector",
        })?;
        if vector.len() != dim {
            return Err(Error::DimensionMismatch {
                table: table.to_string(),
                field: field.to_string(),
                expected: dim,
                actual: vector.len(),
            });
        }

        let rows = self.registry.store().rows_with_vector(&ty, field).await?;

        let mut scored: Vec<ScoredEntity> = rows
            .into_par_iter()
            .map(|entity| {
                let score = entity
                    .vector(field)
                    .map(|v| cosine_similarity(vector, v))
                    .unwrap_or(0.0);
                ScoredEntity { entity, score }
            })
            .collect();

        scored.sort_by(by_score_then_identity);
        scored.truncate(topk);

        debug!("Vector search on {}: {} hits", table, scored.len());
        Ok(scored)
    }

    /// Top `topk` rows by BM25 relevance, ties by ascending identity
    pub async fn search_by_keyword(
        &self,
        table: &str,
        text: &str,
        topk: usize,
    ) -> Result<SearchResult> {
        let ty = self.registry.get(table).await?;
        check_topk(topk)?;

        if ty.keyword_field().is_none() {
            return Err(Error::UnsupportedSearch {
                table: table.to_string(),
                kind: "keyword",
            });
        }

        let Some(expr) = match_expression(text) else {
            return Ok(Vec::new());
        };

        let hits = self
            .registry
            .store()
            .search_fts(&ty, &expr, topk)
            .await?;

        // FTS5 rank is a negated BM25: lower is better
        let scored: Vec<ScoredEntity> = hits
            .into_iter()
            .map(|(entity, rank)| ScoredEntity {
                entity,
                score: -rank,
            })
            .collect();

        debug!("Keyword search on {}: {} hits", table, scored.len());
        Ok(scored)
    }
}

fn check_topk(topk: usize) -> Result<()> {
    if topk == 0 {
        return Err(Error::InvalidArgument("topk must be positive".to_string()));
    }
    Ok(())
}

fn by_score_then_identity(a: &ScoredEntity, b: &ScoredEntity) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.entity.id.cmp(&b.entity.id))
}

/// Quote each alphanumeric term and OR them, so no FTS5 syntax passes through
pub(crate) fn match_expression(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot_product = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;

    for (x, y) in a.iter().zip(b) {
        dot_product += (x * y) as f64;
        norm_a += (x * x) as f64;
        norm_b += (y * y) as f64;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EntityType;
    use crate::store::EntityStore;

    async fn searcher() -> Searcher {
        let registry = TableRegistry::new(EntityStore::in_memory().await.unwrap());
        registry
            .register([
                EntityType::builder("chunk")
                    .primary_key("uid")
                    .keyword("text")
                    .vector("vector", 2)
                    .build()
                    .unwrap(),
                EntityType::builder("plain")
                    .primary_key("uid")
                    .text("text")
                    .build()
                    .unwrap(),
            ])
            .await
            .unwrap();

        let chunk = registry.get("chunk").await.unwrap();
        let rows: Vec<(&str, Vec<f32>)> = vec![
            ("rust is fast", vec![1.0, 0.0]),
            ("python is slow", vec![0.0, 1.0]),
            ("rust and python", vec![1.0, 1.0]),
            ("rust is fast", vec![2.0, 0.0]),
        ];
        let entities = rows
            .into_iter()
            .map(|(text, v)| Entity::new("chunk").with_keyword("text", text).with("vector", v))
            .collect();
        registry.store().insert(&chunk, entities, None).await.unwrap();

        Searcher::new(Arc::new(registry))
    }

    fn ids(result: &SearchResult) -> Vec<i64> {
        result.iter().map(|s| s.entity.id.unwrap()).collect()
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_match_expression_quotes_terms() {
        assert_eq!(
            match_expression("smart people?").as_deref(),
            Some("\"smart\" OR \"people\"")
        );
        assert_eq!(
            match_expression("NEAR(\"a\" b)*").as_deref(),
            Some("\"NEAR\" OR \"a\" OR \"b\"")
        );
        assert_eq!(match_expression("  ?! "), None);
    }

    #[tokio::test]
    async fn test_vector_ties_break_by_identity() {
        let searcher = searcher().await;
        let result = searcher
            .search_by_vector("chunk", &[1.0, 0.0], 3)
            .await
            .unwrap();

        // Rows 1 and 4 point the same way as the query
        assert_eq!(ids(&result), vec![1, 4, 3]);
        assert!(result[0].score >= result[2].score);
    }

    #[tokio::test]
    async fn test_topk_larger_than_table_returns_everything() {
        let searcher = searcher().await;
        let result = searcher
            .search_by_vector("chunk", &[0.0, 1.0], 50)
            .await
            .unwrap();
        assert_eq!(result.len(), 4);
        assert_eq!(result[0].entity.id, Some(2));
    }

    #[tokio::test]
    async fn test_keyword_search() {
        let searcher = searcher().await;
        let result = searcher
            .search_by_keyword("chunk", "python", 10)
            .await
            .unwrap();
        let mut found = ids(&result);
        found.sort();
        assert_eq!(found, vec![2, 3]);
        assert!(result.windows(2).all(|w| w[0].score >= w[1].score));

        assert!(searcher
            .search_by_keyword("chunk", "???", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_keyword_ties_break_by_identity() {
        let searcher = searcher().await;
        let result = searcher
            .search_by_keyword("chunk", "fast", 10)
            .await
            .unwrap();
        assert_eq!(ids(&result), vec![1, 4]);
    }

    #[tokio::test]
    async fn test_contract_errors() {
        let searcher = searcher().await;

        assert!(matches!(
            searcher.search_by_vector("plain", &[1.0], 3).await,
            Err(Error::UnsupportedSearch { kind: "vector", .. })
        ));
        assert!(matches!(
            searcher.search_by_keyword("plain", "x", 3).await,
            Err(Error::UnsupportedSearch { kind: "keyword", .. })
        ));
        assert!(matches!(
            searcher.search_by_vector("chunk", &[1.0, 0.0, 0.0], 3).await,
            Err(Error::DimensionMismatch {
                expected: 2,
                actual: 3,
                ..
            })
        ));
        assert!(matches!(
            searcher.search_by_keyword("chunk", "rust", 0).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            searcher.search_by_vector("missing", &[1.0, 0.0], 3).await,
            Err(Error::UnknownEntityType(_))
        ));
    }
}
