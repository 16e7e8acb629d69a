use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::schema::EntityType;
use crate::store::EntityStore;

/// TableRegistry tracks the entity types known to this process and makes
/// sure their backing tables exist before any stage or search touches them.
pub struct TableRegistry {
    store: EntityStore,
    types: RwLock<HashMap<String, Arc<EntityType>>>,
}

impl TableRegistry {
    pub fn new(store: EntityStore) -> Self {
        Self {
            store,
            types: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Register a set of entity types, creating physical tables for new ones.
    ///
    /// Foreign keys must target a type in this set or one registered earlier.
    /// A type whose declared shape differs from what is already stored under
    /// the same name fails with [`Error::SchemaConflict`].
    pub async fn register(&self, types: impl IntoIterator<Item = EntityType>) -> Result<()> {
        let batch: Vec<EntityType> = types.into_iter().collect();

        {
            let known = self.types.read().await;
            let names: HashSet<&str> = batch
                .iter()
                .map(|t| t.name())
                .chain(known.keys().map(String::as_str))
                .collect();

            for ty in &batch {
                for field in ty.fields() {
                    if let Some(fk) = &field.foreign_key {
                        if !names.contains(fk.table.as_str()) {
                            return Err(Error::UnknownEntityType(fk.table.clone()));
                        }
                    }
                }
                if let Some(existing) = known.get(ty.name()) {
                    if existing.as_ref() != ty {
                        return Err(Error::SchemaConflict {
                            table: ty.name().to_string(),
                            reason: "registered twice with different shapes".to_string(),
                        });
                    }
                }
            }
        }

        for ty in batch {
            self.ensure_table(&ty).await?;
            self.types
                .write()
                .await
                .insert(ty.name().to_string(), Arc::new(ty));
        }

        Ok(())
    }

    async fn ensure_table(&self, ty: &EntityType) -> Result<()> {
        let declared = serde_json::to_string(ty)?;

        if let Some(recorded) = self.store.catalog_entry(ty.name()).await? {
            let recorded: EntityType = serde_json::from_str(&recorded)?;
            if &recorded != ty {
                return Err(Error::SchemaConflict {
                    table: ty.name().to_string(),
                    reason: format!("stored shape is {}", serde_json::to_string(&recorded)?),
                });
            }
            debug!("Entity type {} already present", ty.name());
            return Ok(());
        }

        // A table created outside the catalog is adopted only if its columns line up
        if self.store.table_exists(ty.name()).await? {
            let columns = self.store.column_names(ty.name()).await?;
            let expected: Vec<&str> = ty.fields().iter().map(|f| f.name.as_str()).collect();
            if columns != expected {
                return Err(Error::SchemaConflict {
                    table: ty.name().to_string(),
                    reason: format!("existing columns {:?}, declared {:?}", columns, expected),
                });
            }
        }

        self.store.create_table(ty).await?;
        info!("Registered entity type {} ({})", ty.name(), declared);
        Ok(())
    }

    /// Look up a registered type
    pub async fn get(&self, name: &str) -> Result<Arc<EntityType>> {
        self.types
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownEntityType(name.to_string()))
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> EntityType {
        EntityType::builder("document")
            .primary_key("uid")
            .text("text")
            .build()
            .unwrap()
    }

    fn chunk() -> EntityType {
        EntityType::builder("chunk")
            .primary_key("uid")
            .foreign_key("doc_id", "document")
            .text("text")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = TableRegistry::new(EntityStore::in_memory().await.unwrap());
        registry.register([document(), chunk()]).await.unwrap();

        assert_eq!(registry.get("chunk").await.unwrap().primary_key(), "uid");
        assert_eq!(registry.names().await, vec!["chunk", "document"]);
        assert!(matches!(
            registry.get("query").await.unwrap_err(),
            Error::UnknownEntityType(name) if name == "query"
        ));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = TableRegistry::new(EntityStore::in_memory().await.unwrap());
        registry.register([document()]).await.unwrap();
        registry.register([document(), chunk()]).await.unwrap();
        registry.register([chunk()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_key_target_must_be_known() {
        let registry = TableRegistry::new(EntityStore::in_memory().await.unwrap());
        let err = registry.register([chunk()]).await.unwrap_err();
        assert!(matches!(err, Error::UnknownEntityType(name) if name == "document"));
    }

    #[tokio::test]
    async fn test_conflicting_shape_is_rejected() {
        let store = EntityStore::in_memory().await.unwrap();
        TableRegistry::new(store.clone())
            .register([document()])
            .await
            .unwrap();

        // A second process declares `document` differently
        let changed = EntityType::builder("document")
            .primary_key("uid")
            .text("text")
            .vector("vector", 4)
            .build()
            .unwrap();
        let err = TableRegistry::new(store)
            .register([changed])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SchemaConflict { .. }));
    }

    #[tokio::test]
    async fn test_uncatalogued_table_with_other_columns_conflicts() {
        let store = EntityStore::in_memory().await.unwrap();
        sqlx::query(r#"CREATE TABLE "document" (id TEXT PRIMARY KEY, body TEXT)"#)
            .execute(store.pool())
            .await
            .unwrap();

        let err = TableRegistry::new(store)
            .register([document()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SchemaConflict { .. }));
    }
}
