//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{CacheRepo, ChunkRepo, EntryRepo, GcRepo, ObjectRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    CacheRepo + ChunkRepo + ObjectRepo + EntryRepo + GcRepo + Send + Sync
{
    /// Create tables and indexes if they do not exist.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and run migrations.
    ///
    /// `busy_timeout_secs` bounds how long a statement waits on another
    /// writer's lock before failing.
    pub async fn new(path: impl AsRef<Path>, busy_timeout_secs: u64) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                MetadataError::Config(format!("creating {}: {e}", parent.display()))
            })?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            // One connection serializes writers inside the process; other
            // processes are held off by SQLite's own locking.
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(busy_timeout_secs.max(1)))
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), "opened sqlite metadata store");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn to_i64(value: u64, what: &str) -> MetadataResult<i64> {
    i64::try_from(value).map_err(|_| MetadataError::Internal(format!("{what} overflows i64")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE constraint"))
}

/// Bound parameters per `IN (...)` query, well under SQLite's limit.
const IN_CLAUSE_BATCH: usize = 500;

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use larder_core::ObjectManifest;
    use sqlx::QueryBuilder;
    use std::collections::HashSet;
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[async_trait]
    impl CacheRepo for SqliteStore {
        async fn create_cache(&self, cache: &CacheRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                INSERT INTO caches (cache_id, cache_name, is_public, priority, retention_secs, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(cache.cache_id)
            .bind(&cache.cache_name)
            .bind(cache.is_public)
            .bind(cache.priority)
            .bind(cache.retention_secs)
            .bind(cache.created_at)
            .bind(cache.updated_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(MetadataError::AlreadyExists(format!(
                    "cache '{}'",
                    cache.cache_name
                ))),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_cache(&self, cache_id: Uuid) -> MetadataResult<Option<CacheRow>> {
            let row = sqlx::query_as::<_, CacheRow>("SELECT * FROM caches WHERE cache_id = ?")
                .bind(cache_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_cache_by_name(&self, name: &str) -> MetadataResult<Option<CacheRow>> {
            let row = sqlx::query_as::<_, CacheRow>("SELECT * FROM caches WHERE cache_name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn delete_cache(&self, cache_id: Uuid) -> MetadataResult<u64> {
            let mut tx = self.pool.begin().await?;

            let entries: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries WHERE cache_id = ?")
                    .bind(cache_id)
                    .fetch_one(&mut *tx)
                    .await?;

            // Entries go with the cache via ON DELETE CASCADE.
            let deleted = sqlx::query("DELETE FROM caches WHERE cache_id = ?")
                .bind(cache_id)
                .execute(&mut *tx)
                .await?;
            if deleted.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("cache {cache_id}")));
            }

            tx.commit().await?;
            Ok(entries as u64)
        }

        async fn list_caches(&self) -> MetadataResult<Vec<CacheRow>> {
            let rows = sqlx::query_as::<_, CacheRow>("SELECT * FROM caches ORDER BY cache_name")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl ChunkRepo for SqliteStore {
        async fn insert_pending_chunk(
            &self,
            chunk_hash: &str,
            size_bytes: i64,
            object_key: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO chunks (chunk_hash, size_bytes, object_key, refcount, state, created_at, last_accessed_at)
                VALUES (?, ?, ?, 0, 'pending', ?, ?)
                "#,
            )
            .bind(chunk_hash)
            .bind(size_bytes)
            .bind(object_key)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn get_chunk(&self, chunk_hash: &str) -> MetadataResult<Option<ChunkRow>> {
            let row = sqlx::query_as::<_, ChunkRow>("SELECT * FROM chunks WHERE chunk_hash = ?")
                .bind(chunk_hash)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn mark_chunk_valid(&self, chunk_hash: &str) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE chunks SET state = 'valid' WHERE chunk_hash = ? AND state = 'pending'",
            )
            .bind(chunk_hash)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn touch_valid_chunk(
            &self,
            chunk_hash: &str,
            accessed_at: OffsetDateTime,
        ) -> MetadataResult<Option<ChunkRow>> {
            let row = sqlx::query_as::<_, ChunkRow>(
                r#"
                UPDATE chunks SET last_accessed_at = ?
                WHERE chunk_hash = ? AND state = 'valid'
                RETURNING *
                "#,
            )
            .bind(accessed_at)
            .bind(chunk_hash)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn increment_refcount(&self, chunk_hash: &str, by: i64) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE chunks SET refcount = refcount + ? WHERE chunk_hash = ? AND state = 'valid'",
            )
            .bind(by)
            .bind(chunk_hash)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("valid chunk {chunk_hash}")));
            }
            Ok(())
        }

        async fn decrement_refcount(&self, chunk_hash: &str, by: i64) -> MetadataResult<i64> {
            let refcount: Option<i64> = sqlx::query_scalar(
                r#"
                UPDATE chunks SET refcount = refcount - ?
                WHERE chunk_hash = ? AND refcount >= ?
                RETURNING refcount
                "#,
            )
            .bind(by)
            .bind(chunk_hash)
            .bind(by)
            .fetch_optional(&self.pool)
            .await?;

            match refcount {
                Some(count) => Ok(count),
                None => match self.get_chunk(chunk_hash).await? {
                    Some(row) => Err(MetadataError::Constraint(format!(
                        "chunk {chunk_hash} refcount {} cannot drop by {by}",
                        row.refcount
                    ))),
                    None => Err(MetadataError::NotFound(format!("chunk {chunk_hash}"))),
                },
            }
        }

        async fn claim_chunk_for_deletion(
            &self,
            chunk_hash: &str,
            touched_before: OffsetDateTime,
        ) -> MetadataResult<Option<ChunkRow>> {
            // The refcount re-check and the state change are one statement, so
            // an increment landing first makes the claim miss.
            let row = sqlx::query_as::<_, ChunkRow>(
                r#"
                UPDATE chunks SET state = 'deleting'
                WHERE chunk_hash = ?
                  AND refcount = 0
                  AND state IN ('valid', 'pending')
                  AND last_accessed_at <= ?
                RETURNING *
                "#,
            )
            .bind(chunk_hash)
            .bind(touched_before)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn finish_chunk_deletion(&self, chunk_hash: &str) -> MetadataResult<bool> {
            let result = sqlx::query(
                "DELETE FROM chunks WHERE chunk_hash = ? AND state = 'deleting' AND refcount = 0",
            )
            .bind(chunk_hash)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn revert_chunk_deletion(&self, chunk_hash: &str) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE chunks SET state = 'valid' WHERE chunk_hash = ? AND state = 'deleting'",
            )
            .bind(chunk_hash)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn revert_stale_deletions(&self) -> MetadataResult<u64> {
            let result = sqlx::query("UPDATE chunks SET state = 'valid' WHERE state = 'deleting'")
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }

        async fn get_orphan_chunks(
            &self,
            older_than: OffsetDateTime,
            after: Option<(OffsetDateTime, &str)>,
            limit: u32,
        ) -> MetadataResult<Vec<ChunkRow>> {
            let rows = match after {
                None => {
                    sqlx::query_as::<_, ChunkRow>(
                        r#"
                        SELECT * FROM chunks
                        WHERE refcount = 0
                          AND state IN ('valid', 'pending')
                          AND last_accessed_at <= ?
                        ORDER BY last_accessed_at, chunk_hash
                        LIMIT ?
                        "#,
                    )
                    .bind(older_than)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
                }
                Some((seen_at, seen_hash)) => {
                    sqlx::query_as::<_, ChunkRow>(
                        r#"
                        SELECT * FROM chunks
                        WHERE refcount = 0
                          AND state IN ('valid', 'pending')
                          AND last_accessed_at <= ?
                          AND (last_accessed_at > ?
                               OR (last_accessed_at = ? AND chunk_hash > ?))
                        ORDER BY last_accessed_at, chunk_hash
                        LIMIT ?
                        "#,
                    )
                    .bind(older_than)
                    .bind(seen_at)
                    .bind(seen_at)
                    .bind(seen_hash)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
                }
            };
            Ok(rows)
        }

        async fn get_chunk_stats(&self) -> MetadataResult<ChunkStats> {
            let (count, total_size, unreferenced): (i64, i64, i64) = sqlx::query_as(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(size_bytes), 0),
                       COALESCE(SUM(CASE WHEN refcount = 0 THEN 1 ELSE 0 END), 0)
                FROM chunks
                "#,
            )
            .fetch_one(&self.pool)
            .await?;
            Ok(ChunkStats {
                count: count as u64,
                total_size: total_size as u64,
                unreferenced_count: unreferenced as u64,
            })
        }
    }

    #[async_trait]
    impl ObjectRepo for SqliteStore {
        async fn put_object(
            &self,
            manifest: &ObjectManifest,
            now: OffsetDateTime,
        ) -> MetadataResult<PutObjectOutcome> {
            let nar_hash = manifest.nar_hash.to_hex();
            let nar_size = to_i64(manifest.nar_size, "nar_size")?;
            let chunk_count = to_i64(manifest.chunk_count() as u64, "chunk_count")?;

            let mut tx = self.pool.begin().await?;

            // The primary key makes check-and-insert a single step: of two
            // racing writers exactly one inserts and takes the references.
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO objects (nar_hash, nar_size, chunk_count, manifest_hash, created_at, last_accessed_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&nar_hash)
            .bind(nar_size)
            .bind(chunk_count)
            .bind(manifest.manifest_hash().to_hex())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 0 {
                sqlx::query("UPDATE objects SET last_accessed_at = ? WHERE nar_hash = ?")
                    .bind(now)
                    .bind(&nar_hash)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                return Ok(PutObjectOutcome::Deduplicated);
            }

            // Sorted by hash so concurrent transactions touch rows in one order.
            let mut missing_chunks = Vec::new();
            for (chunk_hash, count) in manifest.occurrences() {
                let updated = sqlx::query(
                    r#"
                    UPDATE chunks SET refcount = refcount + ?, last_accessed_at = ?
                    WHERE chunk_hash = ? AND state = 'valid'
                    "#,
                )
                .bind(to_i64(count, "occurrence count")?)
                .bind(now)
                .bind(chunk_hash.to_hex())
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 0 {
                    missing_chunks.push(chunk_hash.to_hex());
                }
            }

            if !missing_chunks.is_empty() {
                tx.rollback().await?;
                return Err(MetadataError::MissingChunks {
                    nar_hash,
                    missing_chunks,
                });
            }

            for (position, chunk) in manifest.chunks.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO object_chunks (nar_hash, position, chunk_hash) VALUES (?, ?, ?)",
                )
                .bind(&nar_hash)
                .bind(position as i64)
                .bind(chunk.hash.to_hex())
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(PutObjectOutcome::Created)
        }

        async fn get_object(&self, nar_hash: &str) -> MetadataResult<Option<ObjectRow>> {
            let row = sqlx::query_as::<_, ObjectRow>("SELECT * FROM objects WHERE nar_hash = ?")
                .bind(nar_hash)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_object_chunks(&self, nar_hash: &str) -> MetadataResult<Vec<ObjectChunkRow>> {
            let rows = sqlx::query_as::<_, ObjectChunkRow>(
                r#"
                SELECT oc.position, oc.chunk_hash, c.size_bytes, c.object_key
                FROM object_chunks oc
                INNER JOIN chunks c ON c.chunk_hash = oc.chunk_hash
                WHERE oc.nar_hash = ?
                ORDER BY oc.position
                "#,
            )
            .bind(nar_hash)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn touch_object(
            &self,
            nar_hash: &str,
            accessed_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query("UPDATE objects SET last_accessed_at = ? WHERE nar_hash = ?")
                .bind(accessed_at)
                .bind(nar_hash)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn release_object_if_unreferenced(
            &self,
            nar_hash: &str,
        ) -> MetadataResult<Option<ReleasedObject>> {
            let mut tx = self.pool.begin().await?;

            let nar_size: Option<i64> =
                sqlx::query_scalar("SELECT nar_size FROM objects WHERE nar_hash = ?")
                    .bind(nar_hash)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some(nar_size) = nar_size else {
                return Err(MetadataError::NotFound(format!("object {nar_hash}")));
            };

            let entries: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries WHERE nar_hash = ?")
                    .bind(nar_hash)
                    .fetch_one(&mut *tx)
                    .await?;
            if entries > 0 {
                tx.rollback().await?;
                return Ok(None);
            }

            let occurrences: Vec<(String, i64)> = sqlx::query_as(
                r#"
                SELECT chunk_hash, COUNT(*) FROM object_chunks
                WHERE nar_hash = ?
                GROUP BY chunk_hash
                ORDER BY chunk_hash
                "#,
            )
            .bind(nar_hash)
            .fetch_all(&mut *tx)
            .await?;

            for (chunk_hash, count) in &occurrences {
                let updated = sqlx::query(
                    "UPDATE chunks SET refcount = refcount - ? WHERE chunk_hash = ? AND refcount >= ?",
                )
                .bind(count)
                .bind(chunk_hash)
                .bind(count)
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 0 {
                    tx.rollback().await?;
                    return Err(MetadataError::Constraint(format!(
                        "chunk {chunk_hash} holds fewer than {count} references from object {nar_hash}"
                    )));
                }
            }

            sqlx::query("DELETE FROM object_chunks WHERE nar_hash = ?")
                .bind(nar_hash)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM objects WHERE nar_hash = ?")
                .bind(nar_hash)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(Some(ReleasedObject {
                nar_hash: nar_hash.to_string(),
                nar_size,
                chunk_hashes: occurrences.into_iter().map(|(hash, _)| hash).collect(),
            }))
        }

        async fn get_unreferenced_objects(&self) -> MetadataResult<Vec<ObjectRow>> {
            let rows = sqlx::query_as::<_, ObjectRow>(
                r#"
                SELECT o.* FROM objects o
                WHERE NOT EXISTS (
                    SELECT 1 FROM cache_entries e WHERE e.nar_hash = o.nar_hash
                )
                ORDER BY o.last_accessed_at, o.created_at, o.nar_hash
                "#,
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn total_object_bytes(&self) -> MetadataResult<u64> {
            let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(nar_size), 0) FROM objects")
                .fetch_one(&self.pool)
                .await?;
            Ok(total as u64)
        }
    }

    #[async_trait]
    impl EntryRepo for SqliteStore {
        async fn upsert_entry(&self, entry: &CacheEntryRow) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;

            let cache_exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM caches WHERE cache_id = ?)")
                    .bind(entry.cache_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if !cache_exists {
                return Err(MetadataError::NotFound(format!("cache {}", entry.cache_id)));
            }

            let object_exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM objects WHERE nar_hash = ?)")
                    .bind(&entry.nar_hash)
                    .fetch_one(&mut *tx)
                    .await?;
            if !object_exists {
                return Err(MetadataError::NotFound(format!("object {}", entry.nar_hash)));
            }

            sqlx::query(
                r#"
                INSERT INTO cache_entries
                    (cache_id, store_path_hash, store_path, nar_hash, references_json, deriver, ca, created_at, last_accessed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(cache_id, store_path_hash) DO UPDATE SET
                    store_path = excluded.store_path,
                    nar_hash = excluded.nar_hash,
                    references_json = excluded.references_json,
                    deriver = excluded.deriver,
                    ca = excluded.ca,
                    last_accessed_at = excluded.last_accessed_at
                "#,
            )
            .bind(entry.cache_id)
            .bind(&entry.store_path_hash)
            .bind(&entry.store_path)
            .bind(&entry.nar_hash)
            .bind(&entry.references_json)
            .bind(&entry.deriver)
            .bind(&entry.ca)
            .bind(entry.created_at)
            .bind(entry.last_accessed_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        }

        async fn get_entry(
            &self,
            cache_id: Uuid,
            store_path_hash: &str,
        ) -> MetadataResult<Option<CacheEntryRow>> {
            let row = sqlx::query_as::<_, CacheEntryRow>(
                "SELECT * FROM cache_entries WHERE cache_id = ? AND store_path_hash = ?",
            )
            .bind(cache_id)
            .bind(store_path_hash)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn record_access(
            &self,
            cache_id: Uuid,
            store_path_hash: &str,
            accessed_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "UPDATE cache_entries SET last_accessed_at = ? WHERE cache_id = ? AND store_path_hash = ?",
            )
            .bind(accessed_at)
            .bind(cache_id)
            .bind(store_path_hash)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                r#"
                UPDATE objects SET last_accessed_at = ?
                WHERE nar_hash = (
                    SELECT nar_hash FROM cache_entries WHERE cache_id = ? AND store_path_hash = ?
                )
                "#,
            )
            .bind(accessed_at)
            .bind(cache_id)
            .bind(store_path_hash)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        }

        async fn delete_entry(&self, cache_id: Uuid, store_path_hash: &str) -> MetadataResult<bool> {
            let result =
                sqlx::query("DELETE FROM cache_entries WHERE cache_id = ? AND store_path_hash = ?")
                    .bind(cache_id)
                    .bind(store_path_hash)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn missing_entries(
            &self,
            cache_id: Uuid,
            store_path_hashes: &[String],
        ) -> MetadataResult<Vec<String>> {
            let mut present = HashSet::new();
            for batch in store_path_hashes.chunks(IN_CLAUSE_BATCH) {
                let mut qb = QueryBuilder::<Sqlite>::new(
                    "SELECT store_path_hash FROM cache_entries WHERE cache_id = ",
                );
                qb.push_bind(cache_id);
                qb.push(" AND store_path_hash IN (");
                let mut separated = qb.separated(", ");
                for hash in batch {
                    separated.push_bind(hash.as_str());
                }
                separated.push_unseparated(")");

                let found: Vec<String> = qb.build_query_scalar::<String>().fetch_all(&self.pool).await?;
                present.extend(found);
            }

            Ok(store_path_hashes
                .iter()
                .filter(|hash| !present.contains(*hash))
                .cloned()
                .collect())
        }

        async fn list_entries(&self, cache_id: Uuid) -> MetadataResult<Vec<CacheEntryRow>> {
            let rows = sqlx::query_as::<_, CacheEntryRow>(
                "SELECT * FROM cache_entries WHERE cache_id = ? ORDER BY store_path",
            )
            .bind(cache_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn expire_entries(
            &self,
            cache_id: Uuid,
            older_than: OffsetDateTime,
        ) -> MetadataResult<u64> {
            let result = sqlx::query(
                "DELETE FROM cache_entries WHERE cache_id = ? AND last_accessed_at < ?",
            )
            .bind(cache_id)
            .bind(older_than)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }

        async fn count_entries_for_object(&self, nar_hash: &str) -> MetadataResult<u64> {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries WHERE nar_hash = ?")
                    .bind(nar_hash)
                    .fetch_one(&self.pool)
                    .await?;
            Ok(count as u64)
        }
    }

    #[async_trait]
    impl GcRepo for SqliteStore {
        async fn begin_sweep(&self, sweep: &GcSweepRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                INSERT INTO gc_sweeps (sweep_id, state, started_at, finished_at, stats_json)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(sweep.sweep_id)
            .bind(&sweep.state)
            .bind(sweep.started_at)
            .bind(sweep.finished_at)
            .bind(&sweep.stats_json)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                // The partial unique index admits one active row.
                Err(e) if is_unique_violation(&e) => Err(MetadataError::Constraint(
                    "another GC sweep is already active".to_string(),
                )),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_sweep(&self, sweep_id: Uuid) -> MetadataResult<Option<GcSweepRow>> {
            let row = sqlx::query_as::<_, GcSweepRow>(
                "SELECT sweep_id, state, started_at, finished_at, stats_json FROM gc_sweeps WHERE sweep_id = ?",
            )
            .bind(sweep_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn update_sweep_state(
            &self,
            sweep_id: Uuid,
            state: GcSweepState,
            finished_at: Option<OffsetDateTime>,
            stats_json: Option<&str>,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                UPDATE gc_sweeps
                SET state = ?, finished_at = COALESCE(?, finished_at), stats_json = COALESCE(?, stats_json)
                WHERE sweep_id = ?
                "#,
            )
            .bind(state.as_str())
            .bind(finished_at)
            .bind(stats_json)
            .bind(sweep_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("gc sweep {sweep_id}")));
            }
            Ok(())
        }

        async fn get_recent_sweeps(&self, limit: u32) -> MetadataResult<Vec<GcSweepRow>> {
            let rows = sqlx::query_as::<_, GcSweepRow>(
                r#"
                SELECT sweep_id, state, started_at, finished_at, stats_json FROM gc_sweeps
                ORDER BY started_at DESC
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn fail_orphaned_sweeps(&self, now: OffsetDateTime) -> MetadataResult<u64> {
            let result = sqlx::query(
                r#"
                UPDATE gc_sweeps SET state = 'failed', finished_at = ?
                WHERE state IN ('scanning', 'reclaiming')
                "#,
            )
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- Tenant caches
CREATE TABLE IF NOT EXISTS caches (
    cache_id BLOB PRIMARY KEY,
    cache_name TEXT NOT NULL UNIQUE,
    is_public INTEGER NOT NULL DEFAULT 0,
    priority INTEGER NOT NULL DEFAULT 41,
    retention_secs INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Chunks, shared by every cache
CREATE TABLE IF NOT EXISTS chunks (
    chunk_hash TEXT PRIMARY KEY,
    size_bytes INTEGER NOT NULL,
    object_key TEXT NOT NULL,
    refcount INTEGER NOT NULL DEFAULT 0 CHECK (refcount >= 0),
    state TEXT NOT NULL DEFAULT 'pending' CHECK (state IN ('pending', 'valid', 'deleting')),
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_orphans ON chunks(refcount, last_accessed_at);
CREATE INDEX IF NOT EXISTS idx_chunks_state ON chunks(state);

-- Objects (whole NARs)
CREATE TABLE IF NOT EXISTS objects (
    nar_hash TEXT PRIMARY KEY,
    nar_size INTEGER NOT NULL,
    chunk_count INTEGER NOT NULL,
    manifest_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_objects_lru ON objects(last_accessed_at, created_at);

-- Ordered chunk sequence of each object; a chunk may appear at several positions
CREATE TABLE IF NOT EXISTS object_chunks (
    nar_hash TEXT NOT NULL,
    position INTEGER NOT NULL,
    chunk_hash TEXT NOT NULL,
    PRIMARY KEY (nar_hash, position),
    FOREIGN KEY (nar_hash) REFERENCES objects(nar_hash) ON DELETE CASCADE,
    FOREIGN KEY (chunk_hash) REFERENCES chunks(chunk_hash)
);
CREATE INDEX IF NOT EXISTS idx_object_chunks_chunk ON object_chunks(chunk_hash);

-- Per-cache bindings from store paths to objects
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_id BLOB NOT NULL,
    store_path_hash TEXT NOT NULL,
    store_path TEXT NOT NULL,
    nar_hash TEXT NOT NULL,
    references_json TEXT NOT NULL DEFAULT '[]',
    deriver TEXT,
    ca TEXT,
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    PRIMARY KEY (cache_id, store_path_hash),
    FOREIGN KEY (cache_id) REFERENCES caches(cache_id) ON DELETE CASCADE,
    FOREIGN KEY (nar_hash) REFERENCES objects(nar_hash)
);
CREATE INDEX IF NOT EXISTS idx_cache_entries_object ON cache_entries(nar_hash);
CREATE INDEX IF NOT EXISTS idx_cache_entries_access ON cache_entries(cache_id, last_accessed_at);

-- GC sweeps
CREATE TABLE IF NOT EXISTS gc_sweeps (
    sweep_id BLOB PRIMARY KEY,
    singleton INTEGER NOT NULL DEFAULT 1,
    state TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    stats_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_gc_sweeps_started ON gc_sweeps(started_at);
-- At most one sweep may be scanning or reclaiming at a time
CREATE UNIQUE INDEX IF NOT EXISTS idx_gc_sweeps_active ON gc_sweeps(singleton)
    WHERE state IN ('scanning', 'reclaiming');
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;
    use larder_core::{ChunkHash, ChunkRef, NarHash, ObjectManifest};
    use tempfile::TempDir;
    use time::OffsetDateTime;
    use uuid::Uuid;

    async fn store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path().join("metadata.db"), 5)
            .await
            .unwrap();
        (dir, store)
    }

    fn cache_row(name: &str) -> CacheRow {
        let now = OffsetDateTime::now_utc();
        CacheRow {
            cache_id: Uuid::new_v4(),
            cache_name: name.to_string(),
            is_public: false,
            priority: 41,
            retention_secs: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Register `payloads` as valid chunks and build a manifest over them.
    async fn valid_manifest(store: &SqliteStore, payloads: &[&str]) -> ObjectManifest {
        let now = OffsetDateTime::now_utc();
        let mut refs = Vec::new();
        let mut nar = Vec::new();
        for payload in payloads {
            let payload = payload.as_bytes();
            let hash = ChunkHash::compute(payload);
            store
                .insert_pending_chunk(&hash.to_hex(), payload.len() as i64, &hash.to_object_key(), now)
                .await
                .unwrap();
            store.mark_chunk_valid(&hash.to_hex()).await.unwrap();
            refs.push(ChunkRef::new(hash, payload.len() as u64));
            nar.extend_from_slice(payload);
        }
        ObjectManifest::new(NarHash::compute(&nar), nar.len() as u64, refs).unwrap()
    }

    fn entry_row(cache_id: Uuid, sph: &str, nar_hash: &str) -> CacheEntryRow {
        let now = OffsetDateTime::now_utc();
        CacheEntryRow {
            cache_id,
            store_path_hash: sph.to_string(),
            store_path: format!("/nix/store/{sph}-pkg"),
            nar_hash: nar_hash.to_string(),
            references_json: "[]".to_string(),
            deriver: None,
            ca: None,
            created_at: now,
            last_accessed_at: now,
        }
    }

    async fn refcount(store: &SqliteStore, payload: &[u8]) -> i64 {
        store
            .get_chunk(&ChunkHash::compute(payload).to_hex())
            .await
            .unwrap()
            .map(|row| row.refcount)
            .unwrap_or(-1)
    }

    const SPH_A: &str = "0c7hgw0hhvw3dp7jz5r5r2a8nmhxq6hw";
    const SPH_B: &str = "1b9p07z77phvv2hf6gm9f28syp39f1ag";

    #[tokio::test]
    async fn test_cache_crud_and_duplicate_name() {
        let (_dir, store) = store().await;
        let cache = cache_row("team-a");
        store.create_cache(&cache).await.unwrap();

        let fetched = store.get_cache_by_name("team-a").await.unwrap().unwrap();
        assert_eq!(fetched.cache_id, cache.cache_id);
        assert_eq!(fetched.priority, 41);

        let err = store.create_cache(&cache_row("team-a")).await.unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyExists(_)));

        store.create_cache(&cache_row("team-b")).await.unwrap();
        let names: Vec<String> = store
            .list_caches()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.cache_name)
            .collect();
        assert_eq!(names, vec!["team-a", "team-b"]);

        assert_eq!(store.delete_cache(cache.cache_id).await.unwrap(), 0);
        assert!(matches!(
            store.delete_cache(cache.cache_id).await,
            Err(MetadataError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_chunk_lifecycle() {
        let (_dir, store) = store().await;
        let hash = ChunkHash::compute(b"chunk");
        let key = hash.to_object_key();
        let now = OffsetDateTime::now_utc();

        assert!(store.insert_pending_chunk(&hash.to_hex(), 5, &key, now).await.unwrap());
        assert!(!store.insert_pending_chunk(&hash.to_hex(), 5, &key, now).await.unwrap());

        // Pending chunks cannot be referenced.
        assert!(matches!(
            store.increment_refcount(&hash.to_hex(), 1).await,
            Err(MetadataError::NotFound(_))
        ));

        assert!(store.mark_chunk_valid(&hash.to_hex()).await.unwrap());
        assert!(!store.mark_chunk_valid(&hash.to_hex()).await.unwrap());
        store.increment_refcount(&hash.to_hex(), 2).await.unwrap();
        assert_eq!(store.decrement_refcount(&hash.to_hex(), 1).await.unwrap(), 1);
        assert!(matches!(
            store.decrement_refcount(&hash.to_hex(), 2).await,
            Err(MetadataError::Constraint(_))
        ));

        // Referenced chunks cannot be claimed.
        let later = now + time::Duration::seconds(1);
        assert!(store.claim_chunk_for_deletion(&hash.to_hex(), later).await.unwrap().is_none());

        assert_eq!(store.decrement_refcount(&hash.to_hex(), 1).await.unwrap(), 0);
        let claimed = store
            .claim_chunk_for_deletion(&hash.to_hex(), later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.chunk_state(), ChunkState::Deleting);

        // A claimed chunk is not valid, so it cannot gain references.
        assert!(store.increment_refcount(&hash.to_hex(), 1).await.is_err());

        assert!(store.revert_chunk_deletion(&hash.to_hex()).await.unwrap());
        store.claim_chunk_for_deletion(&hash.to_hex(), later).await.unwrap().unwrap();
        assert!(store.finish_chunk_deletion(&hash.to_hex()).await.unwrap());
        assert!(store.get_chunk(&hash.to_hex()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_touch_cutoff() {
        let (_dir, store) = store().await;
        let hash = ChunkHash::compute(b"young");
        let now = OffsetDateTime::now_utc();
        store
            .insert_pending_chunk(&hash.to_hex(), 5, &hash.to_object_key(), now)
            .await
            .unwrap();
        store.mark_chunk_valid(&hash.to_hex()).await.unwrap();

        let before = now - time::Duration::hours(1);
        assert!(store.claim_chunk_for_deletion(&hash.to_hex(), before).await.unwrap().is_none());
        assert!(store.get_orphan_chunks(before, None, 10).await.unwrap().is_empty());
        assert_eq!(store.get_orphan_chunks(now, None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_orphan_pages_resume_after_cursor() {
        let (_dir, store) = store().await;
        let now = OffsetDateTime::now_utc();
        let older = now - time::Duration::minutes(5);
        let mut hashes = Vec::new();
        for (i, at) in [older, now, now].into_iter().enumerate() {
            let hash = ChunkHash::compute(format!("orphan-{i}").as_bytes());
            store
                .insert_pending_chunk(&hash.to_hex(), 5, &hash.to_object_key(), at)
                .await
                .unwrap();
            hashes.push(hash.to_hex());
        }
        let mut same_instant = hashes[1..].to_vec();
        same_instant.sort();

        let first = store.get_orphan_chunks(now, None, 1).await.unwrap();
        assert_eq!(first[0].chunk_hash, hashes[0]);

        // Rows sharing a timestamp are split by hash.
        let cursor = Some((first[0].last_accessed_at, first[0].chunk_hash.as_str()));
        let second = store.get_orphan_chunks(now, cursor, 1).await.unwrap();
        assert_eq!(second[0].chunk_hash, same_instant[0]);

        let cursor = Some((second[0].last_accessed_at, second[0].chunk_hash.as_str()));
        let third = store.get_orphan_chunks(now, cursor, 10).await.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].chunk_hash, same_instant[1]);

        let cursor = Some((third[0].last_accessed_at, third[0].chunk_hash.as_str()));
        assert!(store.get_orphan_chunks(now, cursor, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_touch_skips_chunks_that_are_not_valid() {
        let (_dir, store) = store().await;
        let hash = ChunkHash::compute(b"touched");
        let hex = hash.to_hex();
        let then = OffsetDateTime::now_utc() - time::Duration::hours(1);
        let now = OffsetDateTime::now_utc();

        assert!(store.touch_valid_chunk(&hex, now).await.unwrap().is_none());
        store.insert_pending_chunk(&hex, 5, &hash.to_object_key(), then).await.unwrap();
        assert!(store.touch_valid_chunk(&hex, now).await.unwrap().is_none());

        store.mark_chunk_valid(&hex).await.unwrap();
        let touched = store.touch_valid_chunk(&hex, now).await.unwrap().unwrap();
        assert!(touched.last_accessed_at > then);

        store.claim_chunk_for_deletion(&hex, now).await.unwrap().unwrap();
        let later = now + time::Duration::minutes(1);
        assert!(store.touch_valid_chunk(&hex, later).await.unwrap().is_none());
        let row = store.get_chunk(&hex).await.unwrap().unwrap();
        assert_eq!(row.chunk_state(), ChunkState::Deleting);
        assert_eq!(row.last_accessed_at, touched.last_accessed_at);
    }

    #[tokio::test]
    async fn test_put_object_counts_occurrences_once() {
        let (_dir, store) = store().await;
        let manifest = valid_manifest(&store, &["aaaa", "bbbb", "aaaa"]).await;
        let now = OffsetDateTime::now_utc();

        assert_eq!(
            store.put_object(&manifest, now).await.unwrap(),
            PutObjectOutcome::Created
        );
        assert_eq!(
            store.put_object(&manifest, now).await.unwrap(),
            PutObjectOutcome::Deduplicated
        );

        assert_eq!(refcount(&store, b"aaaa").await, 2);
        assert_eq!(refcount(&store, b"bbbb").await, 1);

        let chunks = store
            .get_object_chunks(&manifest.nar_hash.to_hex())
            .await
            .unwrap();
        let positions: Vec<i64> = chunks.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(chunks[0].chunk_hash, chunks[2].chunk_hash);
    }

    #[tokio::test]
    async fn test_put_object_rolls_back_on_missing_chunk() {
        let (_dir, store) = store().await;
        let present = valid_manifest(&store, &["present"]).await;
        let absent = ChunkHash::compute(b"absent");
        let mut chunks = present.chunks.clone();
        chunks.push(ChunkRef::new(absent, 6));
        let manifest = ObjectManifest::new(NarHash::compute(b"presentabsent"), 13, chunks).unwrap();

        let err = store
            .put_object(&manifest, OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        match err {
            MetadataError::MissingChunks { missing_chunks, .. } => {
                assert_eq!(missing_chunks, vec![absent.to_hex()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(refcount(&store, b"present").await, 0);
        assert!(store
            .get_object(&manifest.nar_hash.to_hex())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_entries_are_scoped_to_their_cache() {
        let (_dir, store) = store().await;
        let team_a = cache_row("team-a");
        let team_b = cache_row("team-b");
        store.create_cache(&team_a).await.unwrap();
        store.create_cache(&team_b).await.unwrap();

        let manifest = valid_manifest(&store, &["shared"]).await;
        store.put_object(&manifest, OffsetDateTime::now_utc()).await.unwrap();
        let nar_hash = manifest.nar_hash.to_hex();

        store
            .upsert_entry(&entry_row(team_a.cache_id, SPH_A, &nar_hash))
            .await
            .unwrap();

        assert!(store.get_entry(team_a.cache_id, SPH_A).await.unwrap().is_some());
        assert!(store.get_entry(team_b.cache_id, SPH_A).await.unwrap().is_none());

        let missing = store
            .missing_entries(team_a.cache_id, &[SPH_A.to_string(), SPH_B.to_string()])
            .await
            .unwrap();
        assert_eq!(missing, vec![SPH_B.to_string()]);

        assert!(!store.delete_entry(team_b.cache_id, SPH_A).await.unwrap());
        assert!(store.delete_entry(team_a.cache_id, SPH_A).await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_entry_requires_cache_and_object() {
        let (_dir, store) = store().await;
        let cache = cache_row("team-a");
        store.create_cache(&cache).await.unwrap();

        let err = store
            .upsert_entry(&entry_row(cache.cache_id, SPH_A, &NarHash::compute(b"x").to_hex()))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(msg) if msg.starts_with("object")));

        let manifest = valid_manifest(&store, &["x"]).await;
        store.put_object(&manifest, OffsetDateTime::now_utc()).await.unwrap();
        let err = store
            .upsert_entry(&entry_row(Uuid::new_v4(), SPH_A, &manifest.nar_hash.to_hex()))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(msg) if msg.starts_with("cache")));
    }

    #[tokio::test]
    async fn test_release_waits_for_last_entry() {
        let (_dir, store) = store().await;
        let team_a = cache_row("team-a");
        let team_b = cache_row("team-b");
        store.create_cache(&team_a).await.unwrap();
        store.create_cache(&team_b).await.unwrap();

        let manifest = valid_manifest(&store, &["one", "two", "one"]).await;
        store.put_object(&manifest, OffsetDateTime::now_utc()).await.unwrap();
        let nar_hash = manifest.nar_hash.to_hex();
        store
            .upsert_entry(&entry_row(team_a.cache_id, SPH_A, &nar_hash))
            .await
            .unwrap();
        store
            .upsert_entry(&entry_row(team_b.cache_id, SPH_A, &nar_hash))
            .await
            .unwrap();
        assert_eq!(store.count_entries_for_object(&nar_hash).await.unwrap(), 2);

        // Deleting a cache cascades to its entries only.
        assert_eq!(store.delete_cache(team_a.cache_id).await.unwrap(), 1);
        assert!(store.release_object_if_unreferenced(&nar_hash).await.unwrap().is_none());
        assert!(store.get_unreferenced_objects().await.unwrap().is_empty());

        store.delete_entry(team_b.cache_id, SPH_A).await.unwrap();
        let unreferenced = store.get_unreferenced_objects().await.unwrap();
        assert_eq!(unreferenced.len(), 1);

        let released = store
            .release_object_if_unreferenced(&nar_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(released.chunk_hashes.len(), 2);
        assert_eq!(refcount(&store, b"one").await, 0);
        assert_eq!(refcount(&store, b"two").await, 0);
        assert!(store.get_object(&nar_hash).await.unwrap().is_none());
        assert!(matches!(
            store.release_object_if_unreferenced(&nar_hash).await,
            Err(MetadataError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_record_access_and_expiry() {
        let (_dir, store) = store().await;
        let cache = cache_row("team-a");
        store.create_cache(&cache).await.unwrap();
        let manifest = valid_manifest(&store, &["payload"]).await;
        store.put_object(&manifest, OffsetDateTime::now_utc()).await.unwrap();
        let nar_hash = manifest.nar_hash.to_hex();

        let mut entry = entry_row(cache.cache_id, SPH_A, &nar_hash);
        let old = OffsetDateTime::now_utc() - time::Duration::days(10);
        entry.last_accessed_at = old;
        store.upsert_entry(&entry).await.unwrap();

        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(1);
        let accessed = OffsetDateTime::now_utc();
        store.record_access(cache.cache_id, SPH_A, accessed).await.unwrap();
        assert_eq!(store.expire_entries(cache.cache_id, cutoff).await.unwrap(), 0);

        let object = store.get_object(&nar_hash).await.unwrap().unwrap();
        assert!(object.last_accessed_at > cutoff);

        let future = accessed + time::Duration::seconds(1);
        assert_eq!(store.expire_entries(cache.cache_id, future).await.unwrap(), 1);
        assert!(store.list_entries(cache.cache_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_active_sweep() {
        let (_dir, store) = store().await;
        let sweep = |state: GcSweepState| GcSweepRow {
            sweep_id: Uuid::new_v4(),
            state: state.as_str().to_string(),
            started_at: OffsetDateTime::now_utc(),
            finished_at: None,
            stats_json: None,
        };

        let first = sweep(GcSweepState::Scanning);
        store.begin_sweep(&first).await.unwrap();
        assert!(matches!(
            store.begin_sweep(&sweep(GcSweepState::Scanning)).await,
            Err(MetadataError::Constraint(_))
        ));

        store
            .update_sweep_state(first.sweep_id, GcSweepState::Reclaiming, None, None)
            .await
            .unwrap();
        assert!(store.begin_sweep(&sweep(GcSweepState::Scanning)).await.is_err());

        store
            .update_sweep_state(
                first.sweep_id,
                GcSweepState::Finished,
                Some(OffsetDateTime::now_utc()),
                Some("{}"),
            )
            .await
            .unwrap();
        let second = sweep(GcSweepState::Scanning);
        store.begin_sweep(&second).await.unwrap();

        assert_eq!(store.fail_orphaned_sweeps(OffsetDateTime::now_utc()).await.unwrap(), 1);
        let row = store.get_sweep(second.sweep_id).await.unwrap().unwrap();
        assert_eq!(row.state, "failed");
        assert_eq!(store.get_recent_sweeps(10).await.unwrap().len(), 2);
    }
}
