use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::inject::{Invocation, Stage};

/// Pipeline orders bound stages over the entity-type graph: a stage that
/// writes type T runs before every stage that reads T.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Stages in dependency order
    pub fn ordered(&self) -> Result<Vec<&Stage>> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..self.stages.len()).map(|i| graph.add_node(i)).collect();

        for (i, producer) in self.stages.iter().enumerate() {
            let Some(sink) = producer.sink() else {
                continue;
            };
            for (j, consumer) in self.stages.iter().enumerate() {
                // A stage never waits on itself
                if i != j && consumer.source().map(|s| s.name()) == Some(sink.name()) {
                    graph.add_edge(nodes[i], nodes[j], ());
                }
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| Error::PipelineCycle(self.stages[graph[cycle.node_id()]].name().to_string()))?;

        Ok(order.into_iter().map(|n| &self.stages[graph[n]]).collect())
    }

    /// Invoke every stage once, in dependency order. Generators that take
    /// parameters need explicit arguments and are skipped.
    pub async fn run(&self) -> Result<Vec<(String, Invocation)>> {
        let mut results = Vec::new();

        for stage in self.ordered()? {
            if stage.is_generator() && !stage.params().is_empty() {
                debug!("Pipeline: skipping {} (needs arguments)", stage.name());
                continue;
            }
            let invocation = stage.invoke().await?;
            results.push((stage.name().to_string(), invocation));
        }

        info!("Pipeline: ran {} stages", results.len());
        Ok(results)
    }

    /// Unprocessed source rows per stage, in dependency order
    pub async fn status(&self) -> Result<Vec<(String, usize)>> {
        let mut status = Vec::new();
        for stage in self.ordered()? {
            status.push((stage.name().to_string(), stage.pending().await?));
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::inject::{transform, Args, Binding, InjectionEngine, Output};
    use crate::registry::TableRegistry;
    use crate::schema::EntityType;
    use crate::store::EntityStore;
    use std::sync::Arc;

    async fn engine() -> InjectionEngine {
        let registry = TableRegistry::new(EntityStore::in_memory().await.unwrap());
        registry
            .register([
                EntityType::builder("a").primary_key("uid").text("v").build().unwrap(),
                EntityType::builder("b")
                    .primary_key("uid")
                    .foreign_key("a_id", "a")
                    .text("v")
                    .build()
                    .unwrap(),
            ])
            .await
            .unwrap();
        InjectionEngine::new(Arc::new(registry))
    }

    fn copy_to(table: &'static str) -> impl crate::inject::Transform {
        transform(["v"], move |args: Args| async move {
            Ok(Output::from(
                Entity::new(table).with("v", format!("{}!", args.text("v")?)),
            ))
        })
    }

    #[tokio::test]
    async fn test_runs_in_dependency_order() {
        let engine = engine().await;
        let seed = engine
            .bind(
                Binding::new(
                    "seed",
                    transform(Vec::<String>::new(), |_| async {
                        Ok(Output::from(Entity::new("a").with("v", "x")))
                    }),
                )
                .output("a"),
            )
            .await
            .unwrap();
        let derive = engine
            .bind(Binding::new("derive", copy_to("b")).input("a").output("b"))
            .await
            .unwrap();
        let report = engine
            .bind(
                Binding::new(
                    "report",
                    transform(["v"], |args: Args| async move {
                        Ok(Output::from(serde_json::json!(args.text("v")?)))
                    }),
                )
                .input("b"),
            )
            .await
            .unwrap();

        // Declared out of order on purpose
        let pipeline = Pipeline::new()
            .with_stage(report)
            .with_stage(derive)
            .with_stage(seed);

        let names: Vec<&str> = pipeline.ordered().unwrap().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["seed", "derive", "report"]);

        let results = pipeline.run().await.unwrap();
        assert_eq!(results[2].1.values, vec![serde_json::json!("x!")]);

        let status = pipeline.status().await.unwrap();
        assert!(status.iter().all(|(_, pending)| *pending == 0));
    }

    #[tokio::test]
    async fn test_cycle_is_rejected() {
        let engine = engine().await;
        let forward = engine
            .bind(Binding::new("forward", copy_to("b")).input("a").output("b"))
            .await
            .unwrap();
        let backward = engine
            .bind(Binding::new("backward", copy_to("a")).input("b").output("a"))
            .await
            .unwrap();

        let pipeline = Pipeline::new().with_stage(forward).with_stage(backward);
        assert!(matches!(pipeline.ordered(), Err(Error::PipelineCycle(_))));
    }

    #[tokio::test]
    async fn test_generators_with_parameters_are_skipped() {
        let engine = engine().await;
        let load = engine
            .bind(
                Binding::new(
                    "load",
                    transform(["title"], |args: Args| async move {
                        Ok(Output::from(Entity::new("a").with("v", args.text("title")?)))
                    }),
                )
                .output("a"),
            )
            .await
            .unwrap();

        let results = Pipeline::new().with_stage(load).run().await.unwrap();
        assert!(results.is_empty());
    }
}
