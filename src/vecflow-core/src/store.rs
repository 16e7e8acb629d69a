use chrono::Utc;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::entity::{Entity, Value};
use crate::error::Result;
use crate::schema::{EntityType, FieldKind};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Catalog of registered entity types and their declared shapes
pub const CATALOG_TABLE: &str = "_vecflow_catalog";
/// Per-stage record of processed source rows
pub const PROGRESS_TABLE: &str = "_vecflow_progress";

/// EntityStore is the SQLite-backed persistence layer for entity rows.
///
/// Every write that the injection engine issues for one unit of work goes
/// through [`EntityStore::insert`], which commits the sink rows and the
/// stage's progress marker in a single transaction.
#[derive(Clone)]
pub struct EntityStore {
    pool: SqlitePool,
}

impl EntityStore {
    /// Open (or create) a database file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(sqlx::Error::Io)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        tracing::info!("Entity store opened at {}", path.display());
        Self::init(pool).await
    }

    /// Private in-memory database. A single connection is kept alive for the
    /// lifetime of the pool, since closing it drops the database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {CATALOG_TABLE} (
                name TEXT PRIMARY KEY,
                schema TEXT NOT NULL,
                created_at DATETIME NOT NULL
            )
        "#
        ))
        .execute(&pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {PROGRESS_TABLE} (
                stage TEXT NOT NULL,
                source_id INTEGER NOT NULL,
                processed_at DATETIME NOT NULL,
                PRIMARY KEY (stage, source_id)
            )
        "#
        ))
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ===== Schema Methods =====

    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Column names of a physical table, in declaration order
    pub async fn column_names(&self, name: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(&format!(r#"PRAGMA table_info("{}")"#, name))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get::<String, _>("name")).collect())
    }

    /// Declared schema JSON recorded for `name`, if any
    pub async fn catalog_entry(&self, name: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as(&format!("SELECT schema FROM {CATALOG_TABLE} WHERE name = ?"))
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(schema,)| schema))
    }

    /// Create the physical representation of `ty` and record it in the catalog.
    /// All statements run in one transaction.
    pub async fn create_table(&self, ty: &EntityType) -> Result<()> {
        let name = ty.name();
        let columns: Vec<String> = ty
            .fields()
            .iter()
            .map(|field| match &field.foreign_key {
                // No column list: the reference resolves to the target's primary key
                Some(fk) => format!(
                    r#""{}" {} REFERENCES "{}""#,
                    field.name,
                    field.kind.sql_type(),
                    fk.table
                ),
                None => format!(r#""{}" {}"#, field.name, field.kind.sql_type()),
            })
            .collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" ({})"#,
            name,
            columns.join(", ")
        ))
        .execute(&mut *tx)
        .await?;

        for field in ty.fields().iter().filter(|f| f.foreign_key.is_some()) {
            sqlx::query(&format!(
                r#"CREATE INDEX IF NOT EXISTS "idx_{0}_{1}" ON "{0}"("{1}")"#,
                name, field.name
            ))
            .execute(&mut *tx)
            .await?;
        }

        if let Some(keyword) = ty.keyword_field() {
            let fts = ty.fts_table();
            let pk = ty.primary_key();

            sqlx::query(&format!(
                r#"
                CREATE VIRTUAL TABLE IF NOT EXISTS "{fts}" USING fts5(
                    "{keyword}",
                    content='{name}',
                    content_rowid='{pk}'
                )
            "#
            ))
            .execute(&mut *tx)
            .await?;

            sqlx::query(&format!(
                r#"
                CREATE TRIGGER IF NOT EXISTS "{fts}_ai" AFTER INSERT ON "{name}" BEGIN
                    INSERT INTO "{fts}"(rowid, "{keyword}") VALUES (new."{pk}", new."{keyword}");
                END
            "#
            ))
            .execute(&mut *tx)
            .await?;

            // Deletion is external to the engine, but the index must not drift when it happens
            sqlx::query(&format!(
                r#"
                CREATE TRIGGER IF NOT EXISTS "{fts}_ad" AFTER DELETE ON "{name}" BEGIN
                    INSERT INTO "{fts}"("{fts}", rowid, "{keyword}")
                    VALUES ('delete', old."{pk}", old."{keyword}");
                END
            "#
            ))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {CATALOG_TABLE} (name, schema, created_at) VALUES (?, ?, ?)"
        ))
        .bind(name)
        .bind(serde_json::to_string(ty)?)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!("Created table {} ({} fields)", name, ty.fields().len());
        Ok(())
    }

    // ===== Row Methods =====

    /// Persist `entities` as rows of `ty`, and mark `(stage, source_id)` processed
    /// when a marker is given. Either everything is written or nothing is.
    ///
    /// Entities must already be validated against `ty`. Returns them with
    /// their freshly assigned identities.
    pub async fn insert(
        &self,
        ty: &EntityType,
        entities: Vec<Entity>,
        marker: Option<(&str, i64)>,
    ) -> Result<Vec<Entity>> {
        let mut tx = self.pool.begin().await?;
        let mut persisted = Vec::with_capacity(entities.len());

        for mut entity in entities {
            let present: Vec<(&str, &Value)> = ty
                .data_fields()
                .filter_map(|f| entity.fields.get(&f.name).map(|v| (f.name.as_str(), v)))
                .collect();

            let sql = if present.is_empty() {
                format!(r#"INSERT INTO "{}" DEFAULT VALUES"#, ty.name())
            } else {
                let columns: Vec<String> =
                    present.iter().map(|(name, _)| format!(r#""{}""#, name)).collect();
                let placeholders = vec!["?"; present.len()].join(", ");
                format!(
                    r#"INSERT INTO "{}" ({}) VALUES ({})"#,
                    ty.name(),
                    columns.join(", "),
                    placeholders
                )
            };

            let mut query = sqlx::query(&sql);
            for (_, value) in &present {
                query = bind_value(query, value)?;
            }
            let id = query.execute(&mut *tx).await?.last_insert_rowid();

            entity.id = Some(id);
            persisted.push(entity);
        }

        if let Some((stage, source_id)) = marker {
            sqlx::query(&format!(
                "INSERT OR IGNORE INTO {PROGRESS_TABLE} (stage, source_id, processed_at) VALUES (?, ?, ?)"
            ))
            .bind(stage)
            .bind(source_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!("Inserted {} rows into {}", persisted.len(), ty.name());
        Ok(persisted)
    }

    /// Get a row by identity
    pub async fn get(&self, ty: &EntityType, id: i64) -> Result<Option<Entity>> {
        let sql = format!(
            r#"SELECT {} FROM "{}" AS d WHERE d."{}" = ?"#,
            select_list(ty, "d"),
            ty.name(),
            ty.primary_key()
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|row| decode_row(ty, &row)).transpose()
    }

    /// All rows of `ty` in identity order
    pub async fn all(&self, ty: &EntityType) -> Result<Vec<Entity>> {
        let sql = format!(
            r#"SELECT {} FROM "{}" AS d ORDER BY d."{}""#,
            select_list(ty, "d"),
            ty.name(),
            ty.primary_key()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(|row| decode_row(ty, row)).collect()
    }

    pub async fn count(&self, ty: &EntityType) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(&format!(r#"SELECT COUNT(*) FROM "{}""#, ty.name()))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ===== Progress Methods =====

    /// Source rows not yet handled by `stage`, in identity order.
    ///
    /// A row counts as handled when a sink row references it through a foreign
    /// key, or when the stage recorded it in the progress table.
    pub async fn unprocessed(
        &self,
        stage: &str,
        source: &EntityType,
        sink: Option<&EntityType>,
    ) -> Result<Vec<Entity>> {
        let sql = format!(
            r#"SELECT {} FROM "{}" AS s WHERE {} ORDER BY s."{}""#,
            select_list(source, "s"),
            source.name(),
            unprocessed_predicate(source, sink),
            source.primary_key()
        );
        let rows = sqlx::query(&sql).bind(stage).fetch_all(&self.pool).await?;
        rows.iter().map(|row| decode_row(source, row)).collect()
    }

    pub async fn count_unprocessed(
        &self,
        stage: &str,
        source: &EntityType,
        sink: Option<&EntityType>,
    ) -> Result<i64> {
        let sql = format!(
            r#"SELECT COUNT(*) FROM "{}" AS s WHERE {}"#,
            source.name(),
            unprocessed_predicate(source, sink)
        );
        let (count,): (i64,) = sqlx::query_as(&sql).bind(stage).fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Record a source row as handled by a stage that persists nothing
    pub async fn mark_processed(&self, stage: &str, source_id: i64) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR IGNORE INTO {PROGRESS_TABLE} (stage, source_id, processed_at) VALUES (?, ?, ?)"
        ))
        .bind(stage)
        .bind(source_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop every progress marker of `stage`
    pub async fn clear_progress(&self, stage: &str) -> Result<u64> {
        let result = sqlx::query(&format!("DELETE FROM {PROGRESS_TABLE} WHERE stage = ?"))
            .bind(stage)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ===== Search Primitives =====

    /// Rows carrying a vector in `field`
    pub async fn rows_with_vector(&self, ty: &EntityType, field: &str) -> Result<Vec<Entity>> {
        let sql = format!(
            r#"SELECT {} FROM "{}" AS d WHERE d."{}" IS NOT NULL"#,
            select_list(ty, "d"),
            ty.name(),
            field
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(|row| decode_row(ty, row)).collect()
    }

    /// FTS5 match over the keyword index, best BM25 rank first, ties by identity.
    /// `match_expr` must already be a safe FTS5 expression.
    pub async fn search_fts(
        &self,
        ty: &EntityType,
        match_expr: &str,
        limit: usize,
    ) -> Result<Vec<(Entity, f64)>> {
        let pk = ty.primary_key();
        let sql = format!(
            r#"
            SELECT {cols}, "{fts}".rank AS rank
            FROM "{fts}"
            JOIN "{table}" AS d ON d."{pk}" = "{fts}".rowid
            WHERE "{fts}" MATCH ?
            ORDER BY "{fts}".rank, d."{pk}"
            LIMIT ?
        "#,
            cols = select_list(ty, "d"),
            fts = ty.fts_table(),
            table = ty.name(),
        );

        let rows = sqlx::query(&sql)
            .bind(match_expr)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let rank: f64 = row.try_get("rank")?;
            results.push((decode_row(ty, &row)?, rank));
        }
        Ok(results)
    }
}

fn unprocessed_predicate(source: &EntityType, sink: Option<&EntityType>) -> String {
    let pk = source.primary_key();
    let mut clauses: Vec<String> = sink
        .into_iter()
        .flat_map(|sink| {
            sink.foreign_keys_to(source.name()).map(move |fk| {
                format!(
                    r#"NOT EXISTS (SELECT 1 FROM "{}" AS k WHERE k."{}" = s."{}")"#,
                    sink.name(),
                    fk,
                    pk
                )
            })
        })
        .collect();

    clauses.push(format!(
        r#"NOT EXISTS (SELECT 1 FROM {PROGRESS_TABLE} AS p WHERE p.stage = ? AND p.source_id = s."{pk}")"#
    ));
    clauses.join(" AND ")
}

fn select_list(ty: &EntityType, alias: &str) -> String {
    ty.fields()
        .iter()
        .map(|f| format!(r#"{}."{}""#, alias, f.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> Result<SqliteQuery<'q>> {
    Ok(match value {
        Value::Null => query.bind(None::<i64>),
        Value::Integer(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) | Value::Keyword(v) => query.bind(v.clone()),
        Value::Bool(v) => query.bind(*v),
        Value::Json(v) => query.bind(serde_json::to_string(v)?),
        Value::Vector(v) => query.bind(serialize_vector(v)),
    })
}

fn decode_row(ty: &EntityType, row: &SqliteRow) -> Result<Entity> {
    let mut entity = Entity::new(ty.name());

    for field in ty.fields() {
        let name = field.name.as_str();
        let value = match field.kind {
            FieldKind::PrimaryKey => {
                entity.id = Some(row.try_get(name)?);
                continue;
            }
            FieldKind::Integer => row.try_get::<Option<i64>, _>(name)?.into(),
            FieldKind::Float => row.try_get::<Option<f64>, _>(name)?.into(),
            FieldKind::Bool => row.try_get::<Option<bool>, _>(name)?.into(),
            FieldKind::Text => row.try_get::<Option<String>, _>(name)?.into(),
            FieldKind::Keyword => row
                .try_get::<Option<String>, _>(name)?
                .map(Value::Keyword)
                .unwrap_or(Value::Null),
            FieldKind::Json => match row.try_get::<Option<String>, _>(name)? {
                Some(json) => Value::Json(serde_json::from_str(&json)?),
                None => Value::Null,
            },
            FieldKind::Vector { .. } => row
                .try_get::<Option<Vec<u8>>, _>(name)?
                .map(|bytes| Value::Vector(deserialize_vector(&bytes)))
                .unwrap_or(Value::Null),
        };
        entity.fields.insert(field.name.clone(), value);
    }

    Ok(entity)
}

/// Serialize vector to bytes (little-endian Float32)
pub(crate) fn serialize_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Deserialize vector from bytes (little-endian Float32)
pub(crate) fn deserialize_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
