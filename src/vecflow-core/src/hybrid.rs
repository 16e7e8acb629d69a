use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::entity::{Entity, Value};
use crate::error::{Error, Result};
use crate::rerank::Reranker;
use crate::schema::FieldKind;
use crate::search::{ScoredEntity, Searcher};

/// Hybrid search: keyword and vector hits merged by identity, then reordered
/// by an external reranker. Source scores are dropped after the merge.
pub struct HybridSearcher {
    searcher: Searcher,
    reranker: Arc<dyn Reranker>,
    text_field: Option<String>,
}

impl HybridSearcher {
    pub fn new(searcher: Searcher, reranker: Arc<dyn Reranker>) -> Self {
        Self {
            searcher,
            reranker,
            text_field: None,
        }
    }

    /// Field whose text is sent to the reranker. Defaults to the keyword field.
    pub fn with_text_field(mut self, field: impl Into<String>) -> Self {
        self.text_field = Some(field.into());
        self
    }

    /// Run both searches to `topk` each, merge, rerank, and keep the first `topk`.
    ///
    /// Either both searches and the rerank succeed, or the call fails.
    #[tracing::instrument(skip(self, query_vector), fields(table = %table))]
    pub async fn search(
        &self,
        table: &str,
        query_text: &str,
        query_vector: &[f32],
        topk: usize,
    ) -> Result<Vec<Entity>> {
        let ty = self.searcher.registry().get(table).await?;
        let text_field = match &self.text_field {
            Some(field) => match ty.field(field).map(|f| f.kind) {
                Some(FieldKind::Text | FieldKind::Keyword) => field.clone(),
                Some(kind) => {
                    return Err(Error::InvalidArgument(format!(
                        "`{}.{}` is a {:?} field, not text",
                        table, field, kind
                    )))
                }
                None => {
                    return Err(Error::InvalidArgument(format!(
                        "`{}` has no field `{}`",
                        table, field
                    )))
                }
            },
            None => ty
                .keyword_field()
                .map(str::to_string)
                .ok_or_else(|| Error::UnsupportedSearch {
                    table: table.to_string(),
                    kind: "keyword",
                })?,
        };

        let keyword = self
            .searcher
            .search_by_keyword(table, query_text, topk)
            .await?;
        let vector = self
            .searcher
            .search_by_vector(table, query_vector, topk)
            .await?;

        let candidates = merge_candidates(&keyword, &vector);
        debug!(
            "Hybrid search: {} keyword + {} vector -> {} candidates",
            keyword.len(),
            vector.len(),
            candidates.len()
        );
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = candidates
            .iter()
            .map(|e| {
                e.get(&text_field)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();

        let order = self
            .reranker
            .rerank(query_text, &texts)
            .await
            .map_err(|source| Error::Collaborator {
                name: "reranker",
                source,
            })?;
        validate_permutation(&order, candidates.len())?;

        let mut slots: Vec<Option<Entity>> = candidates.into_iter().map(Some).collect();
        Ok(order
            .into_iter()
            .take(topk)
            .filter_map(|i| slots[i].take())
            .collect())
    }
}

/// Union two hit lists by identity, keyword hits first. The first instance
/// seen for an identity is kept.
pub fn merge_candidates(keyword: &[ScoredEntity], vector: &[ScoredEntity]) -> Vec<Entity> {
    let mut seen = HashSet::new();
    keyword
        .iter()
        .chain(vector)
        .filter(|hit| seen.insert(hit.entity.id))
        .map(|hit| hit.entity.clone())
        .collect()
}

/// A reranker answer must be a permutation of `0..len`
pub fn validate_permutation(order: &[usize], len: usize) -> Result<()> {
    if order.len() != len {
        return Err(Error::RerankContractViolation(format!(
            "expected {} indices, got {}",
            len,
            order.len()
        )));
    }

    let mut seen = vec![false; len];
    for &index in order {
        match seen.get_mut(index) {
            None => {
                return Err(Error::RerankContractViolation(format!(
                    "index {} out of range for {} candidates",
                    index, len
                )))
            }
            Some(true) => {
                return Err(Error::RerankContractViolation(format!(
                    "index {} repeated",
                    index
                )))
            }
            Some(slot) => *slot = true,
        }
    }

    Ok(())
}
