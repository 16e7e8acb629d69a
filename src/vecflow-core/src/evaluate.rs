use anyhow::Result;
use std::collections::BTreeMap;

use crate::error::Error;

/// Metric name to score
pub type Metrics = BTreeMap<String, f64>;

/// Evaluator scores a retrieved ranking against the one relevant identity
#[async_trait::async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, reference: i64, retrieved: &[i64]) -> Result<Metrics>;
}

/// Single-reference ranking metrics: `map`, `ndcg` and `recall_{k}`
#[derive(Debug, Clone, Copy)]
pub struct RankingEvaluator {
    k: usize,
}

impl RankingEvaluator {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    pub fn recall_key(&self) -> String {
        format!("recall_{}", self.k)
    }

    pub fn score(&self, reference: i64, retrieved: &[i64]) -> Metrics {
        // 1-based position of the reference, if retrieved
        let rank = retrieved
            .iter()
            .position(|id| *id == reference)
            .map(|p| p + 1);

        let (ap, ndcg) = match rank {
            Some(rank) => (1.0 / rank as f64, 1.0 / ((rank + 1) as f64).log2()),
            None => (0.0, 0.0),
        };
        let recall = match rank {
            Some(rank) if rank <= self.k => 1.0,
            _ => 0.0,
        };

        let mut metrics = Metrics::new();
        metrics.insert("map".to_string(), ap);
        metrics.insert("ndcg".to_string(), ndcg);
        metrics.insert(self.recall_key(), recall);
        metrics
    }
}

#[async_trait::async_trait]
impl Evaluator for RankingEvaluator {
    async fn evaluate(&self, reference: i64, retrieved: &[i64]) -> Result<Metrics> {
        Ok(self.score(reference, retrieved))
    }
}

/// Scores must be finite and non-negative
pub fn validate_metrics(metrics: &Metrics) -> crate::Result<()> {
    for (name, value) in metrics {
        if !value.is_finite() || *value < 0.0 {
            return Err(Error::EvaluationContractViolation(format!(
                "metric `{}` has invalid value {}",
                name, value
            )));
        }
    }
    Ok(())
}
