//! SQLite-backed metadata cache.
//!
//! Four record kinds (entities, fields, relationships, enums) keyed by name,
//! each row carrying `cached_at` / `expires_at` unix timestamps. Batches from
//! the parser are applied transactionally, one transaction per batch, so a
//! failed batch never leaves partial rows visible. Expired records are still
//! served; expiry only signals that a refresh is due.
//!
//! Search is ranked: exact name match, then name prefix, then name substring,
//! then label substring, ties broken by name ascending.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::StoreError;
use crate::models::{
    Batch, CachedRecord, Cardinality, EntityDescriptor, EnumDescriptor, EnumMember,
    FieldDescriptor, ParsedRecord, RecordKind, RelationshipDescriptor, SearchHit, SearchPage,
};
use crate::parser::BatchSink;

/// Row counts per record kind, for status reporting.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StoreCounts {
    pub entities: i64,
    pub fields: i64,
    pub relationships: i64,
    pub enums: i64,
}

pub struct MetadataStore {
    pool: SqlitePool,
    ttl_secs: i64,
    max_search_limit: i64,
}

impl MetadataStore {
    /// Opens (creating if needed) the cache database and applies migrations.
    pub async fn open(config: &Config) -> Result<Self, StoreError> {
        let db_path = &config.db.path;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            ttl_secs: i64::from(config.cache.ttl_hours) * 3600,
            max_search_limit: config.cache.max_search_limit,
        };
        store.migrate().await?;

        info!(path = %db_path.display(), "metadata cache opened");
        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                name TEXT PRIMARY KEY,
                label TEXT,
                revision TEXT NOT NULL,
                cached_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entity_fields (
                entity_name TEXT NOT NULL,
                name TEXT NOT NULL,
                data_type TEXT NOT NULL,
                required INTEGER NOT NULL,
                enum_ref TEXT,
                ordinal INTEGER NOT NULL,
                cached_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (entity_name, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relationships (
                source_entity TEXT NOT NULL,
                nav_property TEXT NOT NULL,
                target_entity TEXT NOT NULL,
                cardinality TEXT NOT NULL,
                cached_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (source_entity, nav_property)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS enums (
                name TEXT PRIMARY KEY,
                cached_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS enum_members (
                enum_name TEXT NOT NULL,
                symbol TEXT NOT NULL,
                value INTEGER NOT NULL,
                label TEXT,
                ordinal INTEGER NOT NULL,
                PRIMARY KEY (enum_name, symbol)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_log (
                id TEXT PRIMARY KEY,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                status TEXT NOT NULL,
                entity_count INTEGER NOT NULL DEFAULT 0,
                enum_count INTEGER NOT NULL DEFAULT 0,
                error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_name TEXT,
                operation TEXT NOT NULL,
                success INTEGER NOT NULL,
                latency_ms INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_fields_entity ON entity_fields(entity_name, ordinal)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_entity)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_members_enum ON enum_members(enum_name, ordinal)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Applies one parsed batch in a single transaction. An entity shell
    /// replaces the entity wholesale: its old fields and relationships are
    /// dropped and re-filled by the dependent batches that follow.
    pub async fn upsert_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        let expires_at = now + self.ttl_secs;

        let mut tx = self.pool.begin().await?;

        for record in &batch.records {
            match record {
                ParsedRecord::EntityShell {
                    name,
                    label,
                    revision,
                } => {
                    sqlx::query(
                        r#"
                        INSERT INTO entities (name, label, revision, cached_at, expires_at)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT(name) DO UPDATE SET
                            label = excluded.label,
                            revision = excluded.revision,
                            cached_at = excluded.cached_at,
                            expires_at = excluded.expires_at
                        "#,
                    )
                    .bind(name)
                    .bind(label)
                    .bind(revision)
                    .bind(now)
                    .bind(expires_at)
                    .execute(&mut *tx)
                    .await?;

                    sqlx::query("DELETE FROM entity_fields WHERE entity_name = ?")
                        .bind(name)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query("DELETE FROM relationships WHERE source_entity = ?")
                        .bind(name)
                        .execute(&mut *tx)
                        .await?;
                }
                ParsedRecord::Field(field) => {
                    sqlx::query(
                        r#"
                        INSERT OR REPLACE INTO entity_fields
                            (entity_name, name, data_type, required, enum_ref, ordinal,
                             cached_at, expires_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(&field.entity_name)
                    .bind(&field.name)
                    .bind(&field.data_type)
                    .bind(field.required)
                    .bind(&field.enum_ref)
                    .bind(field.ordinal)
                    .bind(now)
                    .bind(expires_at)
                    .execute(&mut *tx)
                    .await?;
                }
                ParsedRecord::Relationship(rel) => {
                    sqlx::query(
                        r#"
                        INSERT OR REPLACE INTO relationships
                            (source_entity, nav_property, target_entity, cardinality,
                             cached_at, expires_at)
                        VALUES (?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(&rel.source_entity)
                    .bind(&rel.nav_property)
                    .bind(&rel.target_entity)
                    .bind(rel.cardinality.as_str())
                    .bind(now)
                    .bind(expires_at)
                    .execute(&mut *tx)
                    .await?;
                }
                ParsedRecord::Enum(enumeration) => {
                    sqlx::query(
                        r#"
                        INSERT OR REPLACE INTO enums (name, cached_at, expires_at)
                        VALUES (?, ?, ?)
                        "#,
                    )
                    .bind(&enumeration.name)
                    .bind(now)
                    .bind(expires_at)
                    .execute(&mut *tx)
                    .await?;

                    sqlx::query("DELETE FROM enum_members WHERE enum_name = ?")
                        .bind(&enumeration.name)
                        .execute(&mut *tx)
                        .await?;

                    for (ordinal, member) in enumeration.members.iter().enumerate() {
                        sqlx::query(
                            r#"
                            INSERT INTO enum_members (enum_name, symbol, value, label, ordinal)
                            VALUES (?, ?, ?, ?, ?)
                            "#,
                        )
                        .bind(&enumeration.name)
                        .bind(&member.symbol)
                        .bind(member.value)
                        .bind(&member.label)
                        .bind(ordinal as i64)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
            }
        }

        tx.commit().await?;
        debug!(phase = ?batch.phase, records = batch.records.len(), "batch committed");
        Ok(())
    }

    /// Removes one record by name. Entities take their fields and
    /// relationships with them; enums take their members.
    pub async fn invalidate(&self, kind: RecordKind, name: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        match kind {
            RecordKind::Entity => {
                sqlx::query("DELETE FROM entities WHERE name = ?")
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM entity_fields WHERE entity_name = ?")
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM relationships WHERE source_entity = ?")
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
            }
            RecordKind::Enum => {
                sqlx::query("DELETE FROM enums WHERE name = ?")
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM enum_members WHERE enum_name = ?")
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
            }
            RecordKind::Field => {
                let (entity, field) = split_qualified(name);
                sqlx::query("DELETE FROM entity_fields WHERE entity_name = ? AND name = ?")
                    .bind(entity)
                    .bind(field)
                    .execute(&mut *tx)
                    .await?;
            }
            RecordKind::Relationship => {
                let (source, nav) = split_qualified(name);
                sqlx::query("DELETE FROM relationships WHERE source_entity = ? AND nav_property = ?")
                    .bind(source)
                    .bind(nav)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Clears every record of one kind, forcing the next sync to repopulate.
    pub async fn invalidate_kind(&self, kind: RecordKind) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        match kind {
            RecordKind::Entity => {
                sqlx::query("DELETE FROM entities").execute(&mut *tx).await?;
                sqlx::query("DELETE FROM entity_fields")
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM relationships")
                    .execute(&mut *tx)
                    .await?;
            }
            RecordKind::Enum => {
                sqlx::query("DELETE FROM enums").execute(&mut *tx).await?;
                sqlx::query("DELETE FROM enum_members")
                    .execute(&mut *tx)
                    .await?;
            }
            RecordKind::Field => {
                sqlx::query("DELETE FROM entity_fields")
                    .execute(&mut *tx)
                    .await?;
            }
            RecordKind::Relationship => {
                sqlx::query("DELETE FROM relationships")
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Ranked, paginated name search within one record kind. The limit is
    /// clamped to the configured maximum; a miss is an empty page, not an
    /// error.
    pub async fn search(
        &self,
        kind: RecordKind,
        pattern: &str,
        limit: i64,
        offset: i64,
    ) -> Result<SearchPage, StoreError> {
        let limit = limit.clamp(1, self.max_search_limit);
        let offset = offset.max(0);

        let exact = pattern.to_string();
        let prefix = format!("{}%", pattern);
        let contains = format!("%{}%", pattern);

        let (rows, total) = match kind {
            RecordKind::Entity => {
                let rows = sqlx::query(
                    r#"
                    SELECT name, label,
                        CASE
                            WHEN lower(name) = lower(?) THEN 100
                            WHEN name LIKE ? THEN 75
                            WHEN name LIKE ? THEN 50
                            ELSE 25
                        END AS relevance
                    FROM entities
                    WHERE name LIKE ? OR label LIKE ?
                    ORDER BY relevance DESC, name COLLATE NOCASE ASC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(&exact)
                .bind(&prefix)
                .bind(&contains)
                .bind(&contains)
                .bind(&contains)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                let total: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM entities WHERE name LIKE ? OR label LIKE ?",
                )
                .bind(&contains)
                .bind(&contains)
                .fetch_one(&self.pool)
                .await?;
                (rows, total)
            }
            RecordKind::Enum => {
                let rows = sqlx::query(
                    r#"
                    SELECT name, NULL AS label,
                        CASE
                            WHEN lower(name) = lower(?) THEN 100
                            WHEN name LIKE ? THEN 75
                            ELSE 50
                        END AS relevance
                    FROM enums
                    WHERE name LIKE ?
                    ORDER BY relevance DESC, name COLLATE NOCASE ASC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(&exact)
                .bind(&prefix)
                .bind(&contains)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                let total: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM enums WHERE name LIKE ?")
                        .bind(&contains)
                        .fetch_one(&self.pool)
                        .await?;
                (rows, total)
            }
            RecordKind::Field => {
                let rows = sqlx::query(
                    r#"
                    SELECT entity_name || '.' || name AS name, NULL AS label,
                        CASE
                            WHEN lower(name) = lower(?) THEN 100
                            WHEN name LIKE ? THEN 75
                            ELSE 50
                        END AS relevance
                    FROM entity_fields
                    WHERE name LIKE ?
                    ORDER BY relevance DESC, entity_name COLLATE NOCASE ASC,
                             name COLLATE NOCASE ASC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(&exact)
                .bind(&prefix)
                .bind(&contains)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                let total: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM entity_fields WHERE name LIKE ?")
                        .bind(&contains)
                        .fetch_one(&self.pool)
                        .await?;
                (rows, total)
            }
            RecordKind::Relationship => {
                let rows = sqlx::query(
                    r#"
                    SELECT source_entity || '.' || nav_property AS name, NULL AS label,
                        CASE
                            WHEN lower(nav_property) = lower(?) THEN 100
                            WHEN nav_property LIKE ? THEN 75
                            ELSE 50
                        END AS relevance
                    FROM relationships
                    WHERE nav_property LIKE ?
                    ORDER BY relevance DESC, source_entity COLLATE NOCASE ASC,
                             nav_property COLLATE NOCASE ASC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(&exact)
                .bind(&prefix)
                .bind(&contains)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                let total: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM relationships WHERE nav_property LIKE ?")
                        .bind(&contains)
                        .fetch_one(&self.pool)
                        .await?;
                (rows, total)
            }
        };

        let hits = rows
            .into_iter()
            .map(|row| SearchHit {
                name: row.get("name"),
                label: row.get("label"),
                kind,
                relevance: row.get("relevance"),
            })
            .collect();

        Ok(SearchPage {
            hits,
            total,
            limit,
            offset,
        })
    }

    /// Fetches one record by name. Field and relationship names are
    /// qualified: `Entity.Field`, `Source.NavProperty`. A miss is `None`.
    pub async fn get(
        &self,
        kind: RecordKind,
        name: &str,
    ) -> Result<Option<CachedRecord>, StoreError> {
        match kind {
            RecordKind::Entity => Ok(self.get_entity(name).await?.map(CachedRecord::Entity)),
            RecordKind::Enum => Ok(self.get_enum(name).await?.map(CachedRecord::Enum)),
            RecordKind::Field => {
                let (entity, field) = split_qualified(name);
                let row = sqlx::query(
                    r#"
                    SELECT entity_name, name, data_type, required, enum_ref, ordinal
                    FROM entity_fields WHERE entity_name = ? AND name = ?
                    "#,
                )
                .bind(entity)
                .bind(field)
                .fetch_optional(&self.pool)
                .await?;
                Ok(row.map(|r| CachedRecord::Field(field_from_row(&r))))
            }
            RecordKind::Relationship => {
                let (source, nav) = split_qualified(name);
                let row = sqlx::query(
                    r#"
                    SELECT source_entity, nav_property, target_entity, cardinality
                    FROM relationships WHERE source_entity = ? AND nav_property = ?
                    "#,
                )
                .bind(source)
                .bind(nav)
                .fetch_optional(&self.pool)
                .await?;
                Ok(row.map(|r| CachedRecord::Relationship(relationship_from_row(&r))))
            }
        }
    }

    async fn get_entity(&self, name: &str) -> Result<Option<EntityDescriptor>, StoreError> {
        let shell = sqlx::query("SELECT name, label, revision FROM entities WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        let Some(shell) = shell else {
            return Ok(None);
        };

        let fields = sqlx::query(
            r#"
            SELECT entity_name, name, data_type, required, enum_ref, ordinal
            FROM entity_fields WHERE entity_name = ? ORDER BY ordinal ASC
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(field_from_row)
        .collect();

        let relationships = sqlx::query(
            r#"
            SELECT source_entity, nav_property, target_entity, cardinality
            FROM relationships WHERE source_entity = ?
            ORDER BY nav_property COLLATE NOCASE ASC
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(relationship_from_row)
        .collect();

        Ok(Some(EntityDescriptor {
            name: shell.get("name"),
            label: shell.get("label"),
            fields,
            relationships,
            revision: shell.get("revision"),
        }))
    }

    async fn get_enum(&self, name: &str) -> Result<Option<EnumDescriptor>, StoreError> {
        let row = sqlx::query("SELECT name FROM enums WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let members = sqlx::query(
            r#"
            SELECT symbol, value, label FROM enum_members
            WHERE enum_name = ? ORDER BY ordinal ASC
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| EnumMember {
            symbol: r.get("symbol"),
            value: r.get("value"),
            label: r.get("label"),
        })
        .collect();

        Ok(Some(EnumDescriptor {
            name: row.get("name"),
            members,
        }))
    }

    /// True when the record is missing or past its `expires_at`. Expired
    /// records are still returned by `get`; this only signals refresh is due.
    pub async fn is_expired(&self, kind: RecordKind, name: &str) -> Result<bool, StoreError> {
        let expires_at: Option<i64> = match kind {
            RecordKind::Entity => {
                sqlx::query_scalar("SELECT expires_at FROM entities WHERE name = ?")
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await?
            }
            RecordKind::Enum => {
                sqlx::query_scalar("SELECT expires_at FROM enums WHERE name = ?")
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await?
            }
            RecordKind::Field => {
                let (entity, field) = split_qualified(name);
                sqlx::query_scalar(
                    "SELECT expires_at FROM entity_fields WHERE entity_name = ? AND name = ?",
                )
                .bind(entity)
                .bind(field)
                .fetch_optional(&self.pool)
                .await?
            }
            RecordKind::Relationship => {
                let (source, nav) = split_qualified(name);
                sqlx::query_scalar(
                    "SELECT expires_at FROM relationships WHERE source_entity = ? AND nav_property = ?",
                )
                .bind(source)
                .bind(nav)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        Ok(match expires_at {
            Some(expires_at) => expires_at <= Utc::now().timestamp(),
            None => true,
        })
    }

    pub async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let entities: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities")
            .fetch_one(&self.pool)
            .await?;
        let fields: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entity_fields")
            .fetch_one(&self.pool)
            .await?;
        let relationships: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM relationships")
            .fetch_one(&self.pool)
            .await?;
        let enums: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM enums")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreCounts {
            entities,
            fields,
            relationships,
            enums,
        })
    }

    // ========================================================================
    // Sync and usage logs
    // ========================================================================

    pub async fn begin_sync_log(&self) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO sync_log (id, started_at, status) VALUES (?, ?, 'running')")
            .bind(&id)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn finish_sync_log(
        &self,
        id: &str,
        success: bool,
        counts: StoreCounts,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_log
            SET finished_at = ?, status = ?, entity_count = ?, enum_count = ?, error = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(if success { "success" } else { "failed" })
        .bind(counts.entities)
        .bind(counts.enums)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_successful_sync(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let finished_at: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(finished_at) FROM sync_log WHERE status = 'success'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(finished_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()))
    }

    /// Append-only usage record, consumed by observability tooling only.
    pub async fn record_usage(
        &self,
        entity_name: Option<&str>,
        operation: &str,
        success: bool,
        latency_ms: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO usage_log (entity_name, operation, success, latency_ms, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(entity_name)
        .bind(operation)
        .bind(success)
        .bind(latency_ms)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BatchSink for MetadataStore {
    async fn apply_batch(&self, batch: Batch) -> Result<(), StoreError> {
        self.upsert_batch(&batch).await
    }
}

/// Splits `Entity.Field` style names; a bare name maps to an empty member.
fn split_qualified(name: &str) -> (&str, &str) {
    name.split_once('.').unwrap_or((name, ""))
}

fn field_from_row(row: &sqlx::sqlite::SqliteRow) -> FieldDescriptor {
    FieldDescriptor {
        entity_name: row.get("entity_name"),
        name: row.get("name"),
        data_type: row.get("data_type"),
        required: row.get("required"),
        enum_ref: row.get("enum_ref"),
        ordinal: row.get("ordinal"),
    }
}

fn relationship_from_row(row: &sqlx::sqlite::SqliteRow) -> RelationshipDescriptor {
    let cardinality: String = row.get("cardinality");
    RelationshipDescriptor {
        source_entity: row.get("source_entity"),
        nav_property: row.get("nav_property"),
        target_entity: row.get("target_entity"),
        cardinality: Cardinality::parse(&cardinality).unwrap_or(Cardinality::ManyToOne),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Phase;
    use tempfile::TempDir;

    async fn open_store() -> (MetadataStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let config: Config = toml::from_str(&format!(
            r#"
[auth]
tenant_id = "t"
client_id = "c"
client_secret = "s"

[api]
resource_url = "https://example.test"

[db]
path = "{}"
"#,
            dir.path().join("meta.sqlite").display()
        ))
        .unwrap();
        (MetadataStore::open(&config).await.unwrap(), dir)
    }

    fn entity_batches(names: &[&str]) -> Vec<Batch> {
        let shells = names
            .iter()
            .map(|name| ParsedRecord::EntityShell {
                name: name.to_string(),
                label: None,
                revision: "rev".to_string(),
            })
            .collect();
        vec![Batch {
            phase: Phase::Entities,
            records: shells,
        }]
    }

    fn cust_group_batches() -> Vec<Batch> {
        vec![
            Batch {
                phase: Phase::Entities,
                records: vec![ParsedRecord::EntityShell {
                    name: "CustGroup".to_string(),
                    label: Some("Customer groups".to_string()),
                    revision: "rev-1".to_string(),
                }],
            },
            Batch {
                phase: Phase::Fields,
                records: vec![
                    ParsedRecord::Field(FieldDescriptor {
                        entity_name: "CustGroup".to_string(),
                        name: "CustomerGroupId".to_string(),
                        data_type: "Edm.String".to_string(),
                        required: true,
                        enum_ref: None,
                        ordinal: 0,
                    }),
                    ParsedRecord::Field(FieldDescriptor {
                        entity_name: "CustGroup".to_string(),
                        name: "PaymentTerm".to_string(),
                        data_type: "NS.PaymTermEnum".to_string(),
                        required: false,
                        enum_ref: Some("PaymTermEnum".to_string()),
                        ordinal: 1,
                    }),
                ],
            },
            Batch {
                phase: Phase::Relationships,
                records: vec![ParsedRecord::Relationship(RelationshipDescriptor {
                    source_entity: "CustGroup".to_string(),
                    nav_property: "Customers".to_string(),
                    target_entity: "Customer".to_string(),
                    cardinality: Cardinality::OneToMany,
                })],
            },
            Batch {
                phase: Phase::Enums,
                records: vec![ParsedRecord::Enum(EnumDescriptor {
                    name: "PaymTermEnum".to_string(),
                    members: vec![
                        EnumMember {
                            symbol: "Net10".to_string(),
                            value: 0,
                            label: Some("Net 10 days".to_string()),
                        },
                        EnumMember {
                            symbol: "Net30".to_string(),
                            value: 1,
                            label: None,
                        },
                    ],
                })],
            },
        ]
    }

    async fn apply_all(store: &MetadataStore, batches: &[Batch]) {
        for batch in batches {
            store.upsert_batch(batch).await.unwrap();
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let (store, _dir) = open_store().await;
        apply_all(&store, &cust_group_batches()).await;

        let entity = match store.get(RecordKind::Entity, "CustGroup").await.unwrap() {
            Some(CachedRecord::Entity(e)) => e,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(entity.label.as_deref(), Some("Customer groups"));
        assert_eq!(entity.revision, "rev-1");
        assert_eq!(entity.fields.len(), 2);
        assert_eq!(entity.fields[0].name, "CustomerGroupId");
        assert!(entity.fields[0].required);
        assert_eq!(entity.fields[1].enum_ref.as_deref(), Some("PaymTermEnum"));
        assert_eq!(entity.relationships.len(), 1);
        assert_eq!(entity.relationships[0].cardinality, Cardinality::OneToMany);

        let enumeration = match store.get(RecordKind::Enum, "PaymTermEnum").await.unwrap() {
            Some(CachedRecord::Enum(e)) => e,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(enumeration.members.len(), 2);
        assert_eq!(enumeration.members[0].symbol, "Net10");
        assert_eq!(enumeration.members[1].value, 1);

        let field = store
            .get(RecordKind::Field, "CustGroup.PaymentTerm")
            .await
            .unwrap();
        assert!(matches!(field, Some(CachedRecord::Field(f)) if f.ordinal == 1));

        let rel = store
            .get(RecordKind::Relationship, "CustGroup.Customers")
            .await
            .unwrap();
        assert!(matches!(
            rel,
            Some(CachedRecord::Relationship(r)) if r.target_entity == "Customer"
        ));
    }

    #[tokio::test]
    async fn reapplying_identical_batches_is_idempotent() {
        let (store, _dir) = open_store().await;
        let batches = cust_group_batches();
        apply_all(&store, &batches).await;
        let first = store.get(RecordKind::Entity, "CustGroup").await.unwrap();

        apply_all(&store, &batches).await;
        let second = store.get(RecordKind::Entity, "CustGroup").await.unwrap();

        assert_eq!(first, second);
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.entities, 1);
        assert_eq!(counts.fields, 2);
        assert_eq!(counts.relationships, 1);
        assert_eq!(counts.enums, 1);
    }

    #[tokio::test]
    async fn a_new_shell_replaces_the_entity_wholesale() {
        let (store, _dir) = open_store().await;
        apply_all(&store, &cust_group_batches()).await;

        // Next cycle: same entity, one field gone.
        store
            .upsert_batch(&Batch {
                phase: Phase::Entities,
                records: vec![ParsedRecord::EntityShell {
                    name: "CustGroup".to_string(),
                    label: None,
                    revision: "rev-2".to_string(),
                }],
            })
            .await
            .unwrap();
        store
            .upsert_batch(&Batch {
                phase: Phase::Fields,
                records: vec![ParsedRecord::Field(FieldDescriptor {
                    entity_name: "CustGroup".to_string(),
                    name: "CustomerGroupId".to_string(),
                    data_type: "Edm.String".to_string(),
                    required: true,
                    enum_ref: None,
                    ordinal: 0,
                })],
            })
            .await
            .unwrap();

        let entity = match store.get(RecordKind::Entity, "CustGroup").await.unwrap() {
            Some(CachedRecord::Entity(e)) => e,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(entity.revision, "rev-2");
        assert_eq!(entity.fields.len(), 1);
        assert!(entity.relationships.is_empty());
    }

    #[tokio::test]
    async fn exact_name_outranks_prefix_match() {
        let (store, _dir) = open_store().await;
        apply_all(
            &store,
            &entity_batches(&["CustGroupExtended", "CustGroup", "CustVendorBlocked"]),
        )
        .await;

        let page = store
            .search(RecordKind::Entity, "CustGroup", 10, 0)
            .await
            .unwrap();
        let names: Vec<&str> = page.hits.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["CustGroup", "CustGroupExtended"]);
        assert!(page.hits[0].relevance > page.hits[1].relevance);

        let page = store
            .search(RecordKind::Entity, "Cust", 10, 0)
            .await
            .unwrap();
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn label_matches_rank_below_name_matches() {
        let (store, _dir) = open_store().await;
        store
            .upsert_batch(&Batch {
                phase: Phase::Entities,
                records: vec![
                    ParsedRecord::EntityShell {
                        name: "CustGroup".to_string(),
                        label: None,
                        revision: "rev".to_string(),
                    },
                    ParsedRecord::EntityShell {
                        name: "DirPartyTable".to_string(),
                        label: Some("All customer parties".to_string()),
                        revision: "rev".to_string(),
                    },
                ],
            })
            .await
            .unwrap();

        let page = store
            .search(RecordKind::Entity, "cust", 10, 0)
            .await
            .unwrap();
        let names: Vec<&str> = page.hits.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["CustGroup", "DirPartyTable"]);
    }

    #[tokio::test]
    async fn search_limit_is_clamped_and_pages() {
        let (store, _dir) = open_store().await;
        apply_all(
            &store,
            &entity_batches(&["CustA", "CustB", "CustC", "CustD"]),
        )
        .await;

        let page = store
            .search(RecordKind::Entity, "Cust", 100_000, 0)
            .await
            .unwrap();
        assert_eq!(page.limit, 100);

        let page = store.search(RecordKind::Entity, "Cust", 2, 0).await.unwrap();
        assert_eq!(page.hits.len(), 2);
        assert_eq!(page.total, 4);
        assert!(page.has_more());

        let page = store.search(RecordKind::Entity, "Cust", 2, 2).await.unwrap();
        assert_eq!(page.hits.len(), 2);
        assert!(!page.has_more());
    }

    #[tokio::test]
    async fn miss_is_an_empty_result_not_an_error() {
        let (store, _dir) = open_store().await;
        assert!(store
            .get(RecordKind::Entity, "Nothing")
            .await
            .unwrap()
            .is_none());
        let page = store
            .search(RecordKind::Entity, "Nothing", 10, 0)
            .await
            .unwrap();
        assert!(page.hits.is_empty());
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn expired_records_are_flagged_but_still_served() {
        let (store, _dir) = open_store().await;
        apply_all(&store, &cust_group_batches()).await;
        assert!(!store
            .is_expired(RecordKind::Entity, "CustGroup")
            .await
            .unwrap());

        sqlx::query("UPDATE entities SET expires_at = ? WHERE name = 'CustGroup'")
            .bind(Utc::now().timestamp() - 10)
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(store
            .is_expired(RecordKind::Entity, "CustGroup")
            .await
            .unwrap());
        assert!(store
            .get(RecordKind::Entity, "CustGroup")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn missing_record_counts_as_expired() {
        let (store, _dir) = open_store().await;
        assert!(store
            .is_expired(RecordKind::Entity, "Nothing")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn invalidate_removes_the_entity_and_its_children() {
        let (store, _dir) = open_store().await;
        apply_all(&store, &cust_group_batches()).await;

        store
            .invalidate(RecordKind::Entity, "CustGroup")
            .await
            .unwrap();

        assert!(store
            .get(RecordKind::Entity, "CustGroup")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get(RecordKind::Field, "CustGroup.PaymentTerm")
            .await
            .unwrap()
            .is_none());
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.fields, 0);
        assert_eq!(counts.relationships, 0);
        // The enum is not owned by the entity and survives.
        assert_eq!(counts.enums, 1);
    }

    #[tokio::test]
    async fn invalidate_kind_clears_all_entities() {
        let (store, _dir) = open_store().await;
        apply_all(&store, &cust_group_batches()).await;

        store.invalidate_kind(RecordKind::Entity).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.entities, 0);
        assert_eq!(counts.fields, 0);
        assert_eq!(counts.relationships, 0);
        assert_eq!(counts.enums, 1);
    }

    #[tokio::test]
    async fn sync_log_tracks_the_last_success() {
        let (store, _dir) = open_store().await;
        assert!(store.last_successful_sync().await.unwrap().is_none());

        let id = store.begin_sync_log().await.unwrap();
        assert!(store.last_successful_sync().await.unwrap().is_none());

        store
            .finish_sync_log(&id, true, StoreCounts::default(), None)
            .await
            .unwrap();
        assert!(store.last_successful_sync().await.unwrap().is_some());

        let id = store.begin_sync_log().await.unwrap();
        store
            .finish_sync_log(&id, false, StoreCounts::default(), Some("boom"))
            .await
            .unwrap();
        // A later failure does not clear the last success.
        assert!(store.last_successful_sync().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn usage_log_appends() {
        let (store, _dir) = open_store().await;
        store
            .record_usage(Some("CustGroup"), "get_entity", true, 4)
            .await
            .unwrap();
        store
            .record_usage(None, "search_entities", true, 2)
            .await
            .unwrap();
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage_log")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(rows, 2);
    }
}
