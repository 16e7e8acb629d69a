//! Injection engine: binds transform functions to persisted entity types.
//!
//! A [`Stage`] pulls the source rows it has not handled yet, calls its
//! transform once per row (or once, for generators), and persists whatever
//! the transform returns into the sink type. Each source row is one unit of
//! work: its sink rows and its progress marker commit together, so a stage
//! can be re-invoked at any time and resumes where it stopped.

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entity::{Entity, Value};
use crate::error::{Error, Result};
use crate::registry::TableRegistry;
use crate::schema::EntityType;
use crate::store::EntityStore;

/// Named arguments handed to a transform
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: BTreeMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn require(&self, name: &str) -> Result<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| Error::InvalidArgument(format!("missing argument `{}`", name)))
    }

    pub fn text(&self, name: &str) -> Result<&str> {
        let value = self.require(name)?;
        value.as_str().ok_or_else(|| {
            Error::InvalidArgument(format!("`{}` is {}, not text", name, value.kind_name()))
        })
    }

    pub fn integer(&self, name: &str) -> Result<i64> {
        let value = self.require(name)?;
        value.as_i64().ok_or_else(|| {
            Error::InvalidArgument(format!("`{}` is {}, not an integer", name, value.kind_name()))
        })
    }

    pub fn vector(&self, name: &str) -> Result<&[f32]> {
        let value = self.require(name)?;
        value.as_vector().ok_or_else(|| {
            Error::InvalidArgument(format!("`{}` is {}, not a vector", name, value.kind_name()))
        })
    }
}

/// What one transform call produced
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    None,
    Entity(Entity),
    /// Fan-out: one unit of work, many rows
    Entities(Vec<Entity>),
    /// Free-form result of a consumer stage; never persisted
    Value(serde_json::Value),
}

impl From<()> for Output {
    fn from(_: ()) -> Self {
        Output::None
    }
}

impl From<Entity> for Output {
    fn from(entity: Entity) -> Self {
        Output::Entity(entity)
    }
}

impl From<Vec<Entity>> for Output {
    fn from(entities: Vec<Entity>) -> Self {
        Output::Entities(entities)
    }
}

impl From<serde_json::Value> for Output {
    fn from(value: serde_json::Value) -> Self {
        Output::Value(value)
    }
}

/// A user function the engine can drive.
///
/// `params` is the transform's signature: every name listed there is bound
/// to a source field when the stage is bound, and the call receives exactly
/// those names.
#[async_trait]
pub trait Transform: Send + Sync {
    fn params(&self) -> &[String];
    async fn call(&self, args: Args) -> anyhow::Result<Output>;
}

/// Closure-backed [`Transform`]
pub struct FnTransform<F> {
    params: Vec<String>,
    f: F,
}

#[async_trait]
impl<F, Fut> Transform for FnTransform<F>
where
    F: Fn(Args) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Output>> + Send,
{
    fn params(&self) -> &[String] {
        &self.params
    }

    async fn call(&self, args: Args) -> anyhow::Result<Output> {
        (self.f)(args).await
    }
}

/// Build a transform from its parameter names and an async closure
pub fn transform<F, Fut, P, S>(params: P, f: F) -> FnTransform<F>
where
    P: IntoIterator<Item = S>,
    S: Into<String>,
    F: Fn(Args) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Output>> + Send,
{
    FnTransform {
        params: params.into_iter().map(Into::into).collect(),
        f,
    }
}

/// Declaration of a stage: a transform plus its optional source and sink types
pub struct Binding {
    name: String,
    transform: Arc<dyn Transform>,
    input: Option<String>,
    output: Option<String>,
    mapping: Vec<(String, String)>,
}

impl Binding {
    pub fn new(name: impl Into<String>, transform: impl Transform + 'static) -> Self {
        Self {
            name: name.into(),
            transform: Arc::new(transform),
            input: None,
            output: None,
            mapping: Vec::new(),
        }
    }

    /// Source entity type; without one the stage is a generator
    pub fn input(mut self, table: impl Into<String>) -> Self {
        self.input = Some(table.into());
        self
    }

    /// Sink entity type; without one the stage is a consumer
    pub fn output(mut self, table: impl Into<String>) -> Self {
        self.output = Some(table.into());
        self
    }

    /// Feed source field `field` into parameter `param`. Unmapped parameters
    /// read the source field of the same name.
    pub fn map_param(mut self, param: impl Into<String>, field: impl Into<String>) -> Self {
        self.mapping.push((param.into(), field.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParamBinding {
    param: String,
    field: String,
}

/// InjectionEngine validates bindings and hands out invocable stages
pub struct InjectionEngine {
    registry: Arc<TableRegistry>,
    stages: Mutex<HashSet<String>>,
    row_timeout: Option<Duration>,
}

impl InjectionEngine {
    pub fn new(registry: Arc<TableRegistry>) -> Self {
        Self {
            registry,
            stages: Mutex::new(HashSet::new()),
            row_timeout: None,
        }
    }

    /// Bound on a single transform call; exceeding it fails only the current row
    pub fn with_row_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.row_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    /// Validate a binding against the registered schemas and the transform's
    /// signature. All configuration mistakes surface here, before any data is read.
    pub async fn bind(&self, binding: Binding) -> Result<Stage> {
        let mut stages = self.stages.lock().await;
        if stages.contains(&binding.name) {
            return Err(Error::DuplicateStage(binding.name));
        }

        let source = match &binding.input {
            Some(name) => Some(self.registry.get(name).await?),
            None => None,
        };
        let sink = match &binding.output {
            Some(name) => Some(self.registry.get(name).await?),
            None => None,
        };

        let declared: HashSet<&str> = binding
            .transform
            .params()
            .iter()
            .map(String::as_str)
            .collect();
        let mut explicit: HashMap<&str, &str> = HashMap::new();
        for (param, field) in &binding.mapping {
            if !declared.contains(param.as_str()) {
                return Err(Error::binding(
                    &binding.name,
                    param,
                    "not a parameter of the transform",
                ));
            }
            explicit.insert(param, field);
        }

        let params = match &source {
            Some(source) => binding
                .transform
                .params()
                .iter()
                .map(|param| {
                    let field = explicit.get(param.as_str()).copied().unwrap_or(param);
                    if source.field(field).is_none() {
                        return Err(Error::binding(
                            &binding.name,
                            param,
                            format!("`{}` has no field `{}`", source.name(), field),
                        ));
                    }
                    Ok(ParamBinding {
                        param: param.clone(),
                        field: field.to_string(),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => {
                if let Some((param, _)) = binding.mapping.first() {
                    return Err(Error::binding(
                        &binding.name,
                        param,
                        "a stage without a source type has no fields to map",
                    ));
                }
                Vec::new()
            }
        };

        if let (Some(source), Some(sink)) = (&source, &sink) {
            if sink.foreign_keys_to(source.name()).next().is_none() {
                debug!(
                    "Stage {}: {} has no foreign key to {}, progress is tracked per stage",
                    binding.name,
                    sink.name(),
                    source.name()
                );
            }
        }

        stages.insert(binding.name.clone());
        info!(
            "Bound stage {} ({} -> {})",
            binding.name,
            binding.input.as_deref().unwrap_or("-"),
            binding.output.as_deref().unwrap_or("-")
        );

        Ok(Stage {
            inner: Arc::new(StageInner {
                name: binding.name,
                transform: binding.transform,
                source,
                sink,
                params,
                store: self.registry.store().clone(),
                row_timeout: self.row_timeout,
            }),
        })
    }
}

/// Result of one stage invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    /// Persisted rows (or returned rows, for consumers) in source-row order,
    /// then in the order the transform returned them
    pub entities: Vec<Entity>,
    /// Free-form values returned by consumer stages, in source-row order
    pub values: Vec<serde_json::Value>,
    /// Units of work completed: source rows, or 1 for a single call
    pub processed: usize,
}

impl Invocation {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.values.is_empty()
    }

    fn push(&mut self, unit: Unit) {
        self.entities.extend(unit.entities);
        self.values.extend(unit.values);
        self.processed += 1;
    }
}

/// Outputs of one committed unit of work
struct Unit {
    entities: Vec<Entity>,
    values: Vec<serde_json::Value>,
}

struct StageInner {
    name: String,
    transform: Arc<dyn Transform>,
    source: Option<Arc<EntityType>>,
    sink: Option<Arc<EntityType>>,
    params: Vec<ParamBinding>,
    store: EntityStore,
    row_timeout: Option<Duration>,
}

/// A bound, invocable stage. Cheap to clone.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<StageInner>,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage").field("name", &self.inner.name).finish_non_exhaustive()
    }
}

impl Stage {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn source(&self) -> Option<&EntityType> {
        self.inner.source.as_deref()
    }

    pub fn sink(&self) -> Option<&EntityType> {
        self.inner.sink.as_deref()
    }

    /// Generators have no source type and run once per invocation
    pub fn is_generator(&self) -> bool {
        self.inner.source.is_none()
    }

    /// Parameter names of the underlying transform
    pub fn params(&self) -> &[String] {
        self.inner.transform.params()
    }

    /// Run the stage over every source row it has not handled yet, in
    /// identity order. A generator is called exactly once with no arguments;
    /// one that declares parameters is rejected with [`Error::InvalidArgument`].
    ///
    /// Stops at the first failing row; rows committed before it stay
    /// committed and the failing row is retried by the next invocation.
    #[tracing::instrument(skip(self), fields(stage = %self.inner.name, invocation = %Uuid::new_v4()))]
    pub async fn invoke(&self) -> Result<Invocation> {
        let Some(rows) = self.pending_rows().await? else {
            self.check_generator_call()?;
            return self.run_once(Args::new()).await;
        };

        let mut invocation = Invocation::default();
        for row in rows {
            let unit = self.process_row(row).await?;
            invocation.push(unit);
        }

        self.log_summary(&invocation);
        Ok(invocation)
    }

    /// Like [`Stage::invoke`], but runs up to `limit` rows at once. Results are
    /// still reported in source-row order and each row commits on its own.
    #[tracing::instrument(skip(self), fields(stage = %self.inner.name, invocation = %Uuid::new_v4()))]
    pub async fn invoke_concurrent(&self, limit: usize) -> Result<Invocation> {
        let Some(rows) = self.pending_rows().await? else {
            self.check_generator_call()?;
            return self.run_once(Args::new()).await;
        };

        let units: Vec<Unit> = stream::iter(rows)
            .map(|row| self.process_row(row))
            .buffered(limit.max(1))
            .try_collect()
            .await?;

        let mut invocation = Invocation::default();
        for unit in units {
            invocation.push(unit);
        }

        self.log_summary(&invocation);
        Ok(invocation)
    }

    /// Single manual call with explicit arguments, bypassing the source scan.
    /// Outputs are persisted atomically; no source row is marked.
    #[tracing::instrument(skip(self, args), fields(stage = %self.inner.name, invocation = %Uuid::new_v4()))]
    pub async fn invoke_with(&self, args: Args) -> Result<Invocation> {
        self.run_once(args).await
    }

    /// Number of source rows still to be processed (0 for generators)
    pub async fn pending(&self) -> Result<usize> {
        let Some(source) = &self.inner.source else {
            return Ok(0);
        };
        let count = self
            .inner
            .store
            .count_unprocessed(&self.inner.name, source, self.inner.sink.as_deref())
            .await?;
        Ok(count as usize)
    }

    /// Forget which rows this stage has handled. Rows linked from the sink
    /// through a foreign key still count as processed.
    pub async fn reset(&self) -> Result<u64> {
        let cleared = self.inner.store.clear_progress(&self.inner.name).await?;
        info!("Stage {}: cleared {} progress markers", self.inner.name, cleared);
        Ok(cleared)
    }

    /// A generator that declares parameters can only run through `invoke_with`
    fn check_generator_call(&self) -> Result<()> {
        if self.params().is_empty() {
            return Ok(());
        }
        Err(Error::InvalidArgument(format!(
            "stage `{}` takes parameters {:?}; call invoke_with",
            self.inner.name,
            self.params()
        )))
    }

    async fn pending_rows(&self) -> Result<Option<Vec<Entity>>> {
        let Some(source) = &self.inner.source else {
            return Ok(None);
        };

        let rows = self
            .inner
            .store
            .unprocessed(&self.inner.name, source, self.inner.sink.as_deref())
            .await?;

        if rows.is_empty() {
            debug!("Stage {}: nothing to process", self.inner.name);
        } else {
            info!(
                "Stage {}: {} unprocessed {} rows",
                self.inner.name,
                rows.len(),
                source.name()
            );
        }
        Ok(Some(rows))
    }

    async fn run_once(&self, args: Args) -> Result<Invocation> {
        let output = self.call(args, None).await?;
        let unit = self.commit(output, None).await?;

        let mut invocation = Invocation::default();
        invocation.push(unit);
        self.log_summary(&invocation);
        Ok(invocation)
    }

    async fn process_row(&self, row: Entity) -> Result<Unit> {
        let source_id = row.id()?;
        let args = self.extract_args(&row, source_id);

        debug!("Stage {}: processing source row {}", self.inner.name, source_id);
        let output = self.call(args, Some(source_id)).await?;
        self.commit(output, Some(source_id)).await
    }

    fn extract_args(&self, row: &Entity, source_id: i64) -> Args {
        let pk = self.inner.source.as_deref().map(EntityType::primary_key);
        self.inner
            .params
            .iter()
            .fold(Args::new(), |args, binding| {
                let value = if Some(binding.field.as_str()) == pk {
                    Value::Integer(source_id)
                } else {
                    row.get(&binding.field).cloned().unwrap_or(Value::Null)
                };
                args.with(binding.param.clone(), value)
            })
    }

    async fn call(&self, args: Args, source_id: Option<i64>) -> Result<Output> {
        let call = self.inner.transform.call(args);
        let result = match self.inner.row_timeout {
            Some(after) => tokio::time::timeout(after, call)
                .await
                .map_err(|_| Error::Timeout {
                    stage: self.inner.name.clone(),
                    source_id,
                    after,
                })?,
            None => call.await,
        };

        result.map_err(|source| {
            warn!("Stage {} failed: {:#}", self.inner.name, source);
            Error::Transform {
                stage: self.inner.name.clone(),
                source_id,
                source,
            }
        })
    }

    async fn commit(&self, output: Output, source_id: Option<i64>) -> Result<Unit> {
        let (mut entities, values) = match output {
            Output::None => (Vec::new(), Vec::new()),
            Output::Entity(entity) => (vec![entity], Vec::new()),
            Output::Entities(entities) => (entities, Vec::new()),
            Output::Value(value) => (Vec::new(), vec![value]),
        };

        let Some(sink) = self.inner.sink.as_deref() else {
            if let Some(id) = source_id {
                self.inner.store.mark_processed(&self.inner.name, id).await?;
            }
            return Ok(Unit { entities, values });
        };

        if !values.is_empty() {
            return Err(Error::EntityTypeMismatch {
                expected: sink.name().to_string(),
                actual: "value".to_string(),
            });
        }

        if let (Some(source), Some(id)) = (self.inner.source.as_deref(), source_id) {
            for entity in &mut entities {
                for fk in sink.foreign_keys_to(source.name()) {
                    if let Some(previous) = entity.get(fk).and_then(Value::as_i64) {
                        if previous != id {
                            warn!(
                                "Stage {}: overriding {}.{} = {} with source row {}",
                                self.inner.name,
                                sink.name(),
                                fk,
                                previous,
                                id
                            );
                        }
                    }
                    entity.set(fk, id);
                }
            }
        }

        for entity in &entities {
            entity.validate(sink)?;
        }

        let marker = source_id.map(|id| (self.inner.name.as_str(), id));
        let persisted = self.inner.store.insert(sink, entities, marker).await?;
        Ok(Unit {
            entities: persisted,
            values,
        })
    }

    fn log_summary(&self, invocation: &Invocation) {
        if invocation.processed > 0 {
            info!(
                "Stage {}: processed {} units, {} entities, {} values",
                self.inner.name,
                invocation.processed,
                invocation.entities.len(),
                invocation.values.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn document() -> EntityType {
        EntityType::builder("document")
            .primary_key("uid")
            .text("title")
            .text("text")
            .build()
            .unwrap()
    }

    fn chunk() -> EntityType {
        EntityType::builder("chunk")
            .primary_key("uid")
            .foreign_key("doc_id", "document")
            .text("text")
            .vector("vector", 2)
            .build()
            .unwrap()
    }

    async fn engine() -> InjectionEngine {
        let registry = TableRegistry::new(EntityStore::in_memory().await.unwrap());
        registry.register([document(), chunk()]).await.unwrap();
        InjectionEngine::new(Arc::new(registry))
    }

    fn doc(title: &str, text: &str) -> Entity {
        Entity::new("document").with("title", title).with("text", text)
    }

    fn split_words() -> FnTransform<impl Fn(Args) -> futures::future::Ready<anyhow::Result<Output>>> {
        transform(["uid", "text"], |args: Args| {
            let chunks = args.text("text").map(|text| {
                text.split_whitespace()
                    .map(|word| {
                        Entity::new("chunk")
                            .with("text", word)
                            .with("vector", vec![1.0_f32, 0.0])
                    })
                    .collect::<Vec<_>>()
            });
            futures::future::ready(chunks.map(Output::from).map_err(anyhow::Error::from))
        })
    }

    async fn load_docs(engine: &InjectionEngine, docs: Vec<Entity>) -> Stage {
        let docs = Arc::new(docs);
        let stage = engine
            .bind(
                Binding::new(
                    "load",
                    transform(Vec::<String>::new(), move |_| {
                        let docs = docs.clone();
                        async move { Ok(Output::from(docs.as_ref().clone())) }
                    }),
                )
                .output("document"),
            )
            .await
            .unwrap();
        stage.invoke().await.unwrap();
        stage
    }

    #[tokio::test]
    async fn test_generator_fan_out_assigns_fresh_identities() {
        let engine = engine().await;
        let docs: Vec<Entity> = (0..4).map(|i| doc(&format!("d{i}"), "x")).collect();
        let stage = engine
            .bind(
                Binding::new(
                    "load",
                    transform(Vec::<String>::new(), move |_| {
                        let docs = docs.clone();
                        async move { Ok(Output::from(docs)) }
                    }),
                )
                .output("document"),
            )
            .await
            .unwrap();

        let first = stage.invoke().await.unwrap();
        assert_eq!(first.entities.len(), 4);
        assert_eq!(first.processed, 1);
        let ids: HashSet<i64> = first.entities.iter().map(|e| e.id.unwrap()).collect();
        assert_eq!(ids.len(), 4);

        // Generators run once per call regardless of what is stored
        let second = stage.invoke().await.unwrap();
        assert_eq!(second.entities.len(), 4);
        assert!(second.entities[0].id.unwrap() > first.entities[3].id.unwrap());
    }

    #[tokio::test]
    async fn test_fan_out_links_foreign_keys_and_is_idempotent() {
        let engine = engine().await;
        load_docs(&engine, vec![doc("a", "one two three"), doc("b", "four five")]).await;

        let stage = engine
            .bind(Binding::new("split", split_words()).input("document").output("chunk"))
            .await
            .unwrap();
        assert_eq!(stage.pending().await.unwrap(), 2);

        let result = stage.invoke().await.unwrap();
        let texts: Vec<&str> = result
            .entities
            .iter()
            .map(|e| e.text("text").unwrap())
            .collect();
        assert_eq!(texts, vec!["one", "two", "three", "four", "five"]);
        let links: Vec<i64> = result
            .entities
            .iter()
            .map(|e| e.integer("doc_id").unwrap())
            .collect();
        assert_eq!(links, vec![1, 1, 1, 2, 2]);
        assert_eq!(result.processed, 2);

        let again = stage.invoke().await.unwrap();
        assert!(again.is_empty());
        assert_eq!(again.processed, 0);
        let store = engine.registry().store();
        assert_eq!(store.count(&chunk()).await.unwrap(), 5);
        assert_eq!(stage.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_output_marks_row_processed() {
        let engine = engine().await;
        load_docs(&engine, vec![doc("empty", ""), doc("full", "word")]).await;

        let stage = engine
            .bind(Binding::new("split", split_words()).input("document").output("chunk"))
            .await
            .unwrap();
        let result = stage.invoke().await.unwrap();
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.processed, 2);

        assert!(stage.invoke().await.unwrap().is_empty());
        assert_eq!(stage.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_row_is_retried_next_time() {
        let engine = engine().await;
        load_docs(&engine, vec![doc("a", "x"), doc("b", "y"), doc("c", "z")]).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let stage = engine
            .bind(
                Binding::new(
                    "flaky",
                    transform(["title"], move |args: Args| {
                        let attempt = counter.fetch_add(1, Ordering::SeqCst);
                        let title = args.text("title").map(str::to_string);
                        async move {
                            let title = title?;
                            // The first attempt at `b` fails
                            if title == "b" && attempt == 1 {
                                anyhow::bail!("upstream unavailable");
                            }
                            Ok(Output::from(Entity::new("chunk").with("text", title)))
                        }
                    }),
                )
                .input("document")
                .output("chunk"),
            )
            .await
            .unwrap();

        let err = stage.invoke().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transform {
                source_id: Some(2),
                ..
            }
        ));
        assert!(err.is_retryable());
        // `a` stays committed, `b` and `c` are still pending
        assert_eq!(stage.pending().await.unwrap(), 2);

        let retry = stage.invoke().await.unwrap();
        let texts: Vec<&str> = retry.entities.iter().map(|e| e.text("text").unwrap()).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_writes_nothing() {
        let engine = engine().await;
        load_docs(&engine, vec![doc("a", "x")]).await;

        let stage = engine
            .bind(
                Binding::new(
                    "embed",
                    transform(["text"], |_| async {
                        Ok(Output::from(vec![
                            Entity::new("chunk").with("vector", vec![1.0_f32, 0.0]),
                            Entity::new("chunk").with("vector", vec![1.0_f32, 0.0, 0.0]),
                        ]))
                    }),
                )
                .input("document")
                .output("chunk"),
            )
            .await
            .unwrap();

        let err = stage.invoke().await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 2, actual: 3, .. }));
        assert_eq!(engine.registry().store().count(&chunk()).await.unwrap(), 0);
        assert_eq!(stage.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bind_validates_parameters() {
        let engine = engine().await;

        let err = engine
            .bind(
                Binding::new("bad", transform(["body"], |_| async { Ok(Output::None) }))
                    .input("document"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ParameterBinding { ref param, .. } if param == "body"));

        let err = engine
            .bind(
                Binding::new("bad2", transform(["text"], |_| async { Ok(Output::None) }))
                    .input("document")
                    .map_param("nope", "title"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ParameterBinding { .. }));

        let err = engine
            .bind(
                Binding::new("bad3", transform(["title"], |_| async { Ok(Output::None) }))
                    .map_param("title", "title"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ParameterBinding { .. }));

        let err = engine
            .bind(Binding::new("bad4", transform(["x"], |_| async { Ok(Output::None) })).input("query"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownEntityType(_)));
    }

    #[tokio::test]
    async fn test_explicit_mapping_and_identity_exposure() {
        let engine = engine().await;
        load_docs(&engine, vec![doc("a", "x")]).await;

        let stage = engine
            .bind(
                Binding::new(
                    "echo",
                    transform(["id", "heading"], |args: Args| async move {
                        Ok(Output::from(serde_json::json!({
                            "id": args.integer("id")?,
                            "heading": args.text("heading")?,
                        })))
                    }),
                )
                .input("document")
                .map_param("id", "uid")
                .map_param("heading", "title"),
            )
            .await
            .unwrap();

        let result = stage.invoke().await.unwrap();
        assert_eq!(result.values, vec![serde_json::json!({"id": 1, "heading": "a"})]);
    }

    #[tokio::test]
    async fn test_duplicate_stage_name() {
        let engine = engine().await;
        let make = || Binding::new("same", transform(Vec::<String>::new(), |_| async { Ok(Output::None) }));
        engine.bind(make()).await.unwrap();
        assert!(matches!(
            engine.bind(make()).await.unwrap_err(),
            Error::DuplicateStage(_)
        ));
    }

    #[tokio::test]
    async fn test_consumer_stage_is_tracked_and_resettable() {
        let engine = engine().await;
        load_docs(&engine, vec![doc("a", "x"), doc("b", "y")]).await;

        let stage = engine
            .bind(
                Binding::new(
                    "score",
                    transform(["title"], |args: Args| async move {
                        Ok(Output::from(serde_json::json!(args.text("title")?.len())))
                    }),
                )
                .input("document"),
            )
            .await
            .unwrap();

        assert_eq!(stage.invoke().await.unwrap().values.len(), 2);
        assert!(stage.invoke().await.unwrap().is_empty());

        assert_eq!(stage.reset().await.unwrap(), 2);
        assert_eq!(stage.invoke().await.unwrap().values.len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_fails_only_the_row() {
        let engine = InjectionEngine::new(engine().await.registry().clone())
            .with_row_timeout(Some(Duration::from_millis(20)));
        load_docs(&engine, vec![doc("a", "x")]).await;

        let stage = engine
            .bind(
                Binding::new(
                    "slow",
                    transform(["text"], |_| async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(Output::None)
                    }),
                )
                .input("document"),
            )
            .await
            .unwrap();

        let err = stage.invoke().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { source_id: Some(1), .. }));
        assert_eq!(stage.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_invocation_keeps_source_order() {
        let engine = engine().await;
        let docs = (0..8).map(|i| doc(&format!("d{i}"), &format!("w{i}"))).collect();
        load_docs(&engine, docs).await;

        let stage = engine
            .bind(
                Binding::new(
                    "split",
                    transform(["uid", "text"], |args: Args| async move {
                        // Later rows finish first
                        let uid = args.integer("uid")?;
                        tokio::time::sleep(Duration::from_millis((10 - uid) as u64 * 3)).await;
                        Ok(Output::from(
                            Entity::new("chunk").with("text", args.text("text")?),
                        ))
                    }),
                )
                .input("document")
                .output("chunk"),
            )
            .await
            .unwrap();

        let result = stage.invoke_concurrent(4).await.unwrap();
        let texts: Vec<String> = result
            .entities
            .iter()
            .map(|e| e.text("text").unwrap().to_string())
            .collect();
        let expected: Vec<String> = (0..8).map(|i| format!("w{i}")).collect();
        assert_eq!(texts, expected);
        assert!(stage.invoke_concurrent(4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_invocation_with_arguments() {
        let engine = engine().await;
        let stage = engine
            .bind(
                Binding::new(
                    "load_document",
                    transform(["title"], |args: Args| async move {
                        let title = args.text("title")?;
                        Ok(Output::from(doc(title, &format!("essay about {title}"))))
                    }),
                )
                .output("document"),
            )
            .await
            .unwrap();

        let result = stage
            .invoke_with(Args::new().with("title", "smart"))
            .await
            .unwrap();
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].text("text").unwrap(), "essay about smart");
        assert_eq!(result.entities[0].id, Some(1));
    }

    #[tokio::test]
    async fn test_generator_with_parameters_needs_arguments() {
        let engine = engine().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let stage = engine
            .bind(
                Binding::new(
                    "load_document",
                    transform(["title"], move |args: Args| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async move { Ok(Output::from(doc(args.text("title")?, "x"))) }
                    }),
                )
                .output("document"),
            )
            .await
            .unwrap();

        let err = stage.invoke().await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(!err.is_retryable());
        assert!(matches!(
            stage.invoke_concurrent(2).await.unwrap_err(),
            Error::InvalidArgument(_)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
