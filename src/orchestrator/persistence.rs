//! Queue state persistence.
//!
//! The contract: a hash of jobs keyed by id plus an ordered queue of ids,
//! written atomically. SQLite is the primary store; a JSON document on
//! disk is the fallback when SQLite is unavailable. On load, malformed
//! entries are skipped rather than failing the whole restore.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::job::{Job, JobId};

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    payload TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS queue (
    pos INTEGER PRIMARY KEY,
    job_id TEXT NOT NULL
);
";

/// Everything a restore yields. Job order in `jobs` is unspecified; the
/// queue carries the ordering.
#[derive(Debug, Default)]
pub struct PersistedState {
    pub jobs: Vec<Job>,
    pub queue: Vec<JobId>,
}

/// Atomic hash-plus-list store for queue state.
pub trait StateStore: Send + Sync {
    /// Upsert one job record.
    fn save_job<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<()>>;

    /// Overwrite the queue ordering.
    fn save_queue<'a>(&'a self, queue: &'a [JobId]) -> BoxFuture<'a, Result<()>>;

    /// Full-state flush: every job plus the queue, as one atomic write.
    fn save_snapshot<'a>(&'a self, jobs: &'a [Job], queue: &'a [JobId])
    -> BoxFuture<'a, Result<()>>;

    fn remove_job<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;

    fn fetch_job<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Job>>>;

    fn load(&self) -> BoxFuture<'_, Result<PersistedState>>;
}

// =============================================================================
// SQLite store
// =============================================================================

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (or create) the state database at `dir/queue_state.sqlite`.
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .context("creating state directory")?;
        let db_path = dir.join("queue_state.sqlite");

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("opening queue state database")?;

        sqlx::query(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("initializing queue state schema")?;

        info!("queue state store opened at {}", db_path.display());
        Ok(Self { pool })
    }
}

impl StateStore for SqliteStateStore {
    fn save_job<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let payload = serde_json::to_string(job).context("serializing job")?;
            sqlx::query("INSERT INTO jobs (id, payload) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET payload = excluded.payload")
                .bind(&job.id)
                .bind(payload)
                .execute(&self.pool)
                .await
                .context("saving job")?;
            Ok(())
        })
    }

    fn save_queue<'a>(&'a self, queue: &'a [JobId]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context("starting queue write")?;
            sqlx::query("DELETE FROM queue").execute(&mut *tx).await?;
            for (pos, id) in queue.iter().enumerate() {
                sqlx::query("INSERT INTO queue (pos, job_id) VALUES (?, ?)")
                    .bind(pos as i64)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await.context("committing queue write")?;
            Ok(())
        })
    }

    fn save_snapshot<'a>(
        &'a self,
        jobs: &'a [Job],
        queue: &'a [JobId],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context("starting snapshot")?;
            for job in jobs {
                let payload = serde_json::to_string(job).context("serializing job")?;
                sqlx::query("INSERT INTO jobs (id, payload) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET payload = excluded.payload")
                    .bind(&job.id)
                    .bind(payload)
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query("DELETE FROM queue").execute(&mut *tx).await?;
            for (pos, id) in queue.iter().enumerate() {
                sqlx::query("INSERT INTO queue (pos, job_id) VALUES (?, ?)")
                    .bind(pos as i64)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await.context("committing snapshot")?;
            Ok(())
        })
    }

    fn remove_job<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM jobs WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await
                .context("removing job")?;
            Ok(())
        })
    }

    fn fetch_job<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Job>>> {
        Box::pin(async move {
            let row: Option<(String,)> = sqlx::query_as("SELECT payload FROM jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("fetching job")?;
            Ok(row.and_then(|(payload,)| match serde_json::from_str(&payload) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(id, "skipping malformed job record: {e}");
                    None
                }
            }))
        })
    }

    fn load(&self) -> BoxFuture<'_, Result<PersistedState>> {
        Box::pin(async move {
            let mut state = PersistedState::default();

            let rows = sqlx::query("SELECT id, payload FROM jobs")
                .fetch_all(&self.pool)
                .await
                .context("loading jobs")?;
            for row in rows {
                let id: String = row.get(0);
                let payload: String = row.get(1);
                match serde_json::from_str::<Job>(&payload) {
                    Ok(job) => state.jobs.push(job),
                    Err(e) => warn!(%id, "skipping malformed job record: {e}"),
                }
            }

            let rows = sqlx::query("SELECT job_id FROM queue ORDER BY pos ASC")
                .fetch_all(&self.pool)
                .await
                .context("loading queue")?;
            state.queue = rows.into_iter().map(|row| row.get::<String, _>(0)).collect();

            debug!(
                jobs = state.jobs.len(),
                queued = state.queue.len(),
                "loaded queue state from sqlite"
            );
            Ok(state)
        })
    }
}

// =============================================================================
// File store
// =============================================================================

/// On-disk document shape: `{"jobs": [[id, job], ...], "queue": [ids]}`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FileDocument {
    jobs: Vec<(JobId, serde_json::Value)>,
    queue: Vec<JobId>,
}

pub struct FileStateStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles on the document.
    lock: tokio::sync::Mutex<()>,
}

impl FileStateStore {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("queue_state.json"),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_document(&self) -> FileDocument {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("malformed queue state file, starting empty: {e}");
                    FileDocument::default()
                }
            },
            Err(_) => FileDocument::default(),
        }
    }

    fn write_document(&self, doc: &FileDocument) -> Result<()> {
        let dir = self
            .path
            .parent()
            .context("state file has no parent directory")?;
        std::fs::create_dir_all(dir).context("creating state directory")?;
        let bytes = serde_json::to_vec_pretty(doc).context("serializing queue state")?;

        // Atomic replace: write a sibling temp file, then rename over.
        let mut tmp = tempfile::NamedTempFile::new_in(dir).context("creating temp state file")?;
        std::io::Write::write_all(&mut tmp, &bytes).context("writing temp state file")?;
        tmp.persist(&self.path)
            .context("replacing queue state file")?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn save_job<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let mut doc = self.read_document().await;
            let value = serde_json::to_value(job).context("serializing job")?;
            match doc.jobs.iter_mut().find(|(id, _)| *id == job.id) {
                Some((_, existing)) => *existing = value,
                None => doc.jobs.push((job.id.clone(), value)),
            }
            self.write_document(&doc)
        })
    }

    fn save_queue<'a>(&'a self, queue: &'a [JobId]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let mut doc = self.read_document().await;
            doc.queue = queue.to_vec();
            self.write_document(&doc)
        })
    }

    fn save_snapshot<'a>(
        &'a self,
        jobs: &'a [Job],
        queue: &'a [JobId],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let doc = FileDocument {
                jobs: jobs
                    .iter()
                    .filter_map(|job| {
                        serde_json::to_value(job).ok().map(|v| (job.id.clone(), v))
                    })
                    .collect(),
                queue: queue.to_vec(),
            };
            self.write_document(&doc)
        })
    }

    fn remove_job<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let mut doc = self.read_document().await;
            doc.jobs.retain(|(job_id, _)| job_id != id);
            doc.queue.retain(|job_id| job_id != id);
            self.write_document(&doc)
        })
    }

    fn fetch_job<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Job>>> {
        Box::pin(async move {
            let doc = self.read_document().await;
            Ok(doc
                .jobs
                .into_iter()
                .find(|(job_id, _)| job_id == id)
                .and_then(|(_, value)| serde_json::from_value(value).ok()))
        })
    }

    fn load(&self) -> BoxFuture<'_, Result<PersistedState>> {
        Box::pin(async move {
            let doc = self.read_document().await;
            let mut state = PersistedState {
                jobs: Vec::with_capacity(doc.jobs.len()),
                queue: doc.queue,
            };
            for (id, value) in doc.jobs {
                match serde_json::from_value::<Job>(value) {
                    Ok(job) => state.jobs.push(job),
                    Err(e) => warn!(%id, "skipping malformed job entry: {e}"),
                }
            }
            Ok(state)
        })
    }
}

// =============================================================================
// Fallback wrapper
// =============================================================================

/// Primary store with a file fallback. Writes try the primary first and
/// fall back per call; snapshots land in both so the fallback never goes
/// stale by more than one flush interval.
pub struct FallbackStateStore {
    primary: Option<Arc<dyn StateStore>>,
    fallback: Arc<FileStateStore>,
}

impl FallbackStateStore {
    #[must_use]
    pub fn new(primary: Option<Arc<dyn StateStore>>, fallback: Arc<FileStateStore>) -> Self {
        Self { primary, fallback }
    }

    /// Open SQLite at `dir`, degrading to file-only when that fails.
    pub async fn open(dir: &Path) -> Self {
        let fallback = Arc::new(FileStateStore::new(dir));
        match SqliteStateStore::open(dir).await {
            Ok(store) => Self::new(Some(Arc::new(store)), fallback),
            Err(e) => {
                warn!("primary state store unavailable, using file fallback: {e}");
                Self::new(None, fallback)
            }
        }
    }
}

impl StateStore for FallbackStateStore {
    fn save_job<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(primary) = &self.primary {
                match primary.save_job(job).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!("primary save_job failed, using fallback: {e}"),
                }
            }
            self.fallback.save_job(job).await
        })
    }

    fn save_queue<'a>(&'a self, queue: &'a [JobId]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(primary) = &self.primary {
                match primary.save_queue(queue).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!("primary save_queue failed, using fallback: {e}"),
                }
            }
            self.fallback.save_queue(queue).await
        })
    }

    fn save_snapshot<'a>(
        &'a self,
        jobs: &'a [Job],
        queue: &'a [JobId],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(primary) = &self.primary
                && let Err(e) = primary.save_snapshot(jobs, queue).await
            {
                warn!("primary snapshot failed: {e}");
            }
            self.fallback.save_snapshot(jobs, queue).await
        })
    }

    fn remove_job<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(primary) = &self.primary
                && let Err(e) = primary.remove_job(id).await
            {
                warn!("primary remove_job failed: {e}");
            }
            self.fallback.remove_job(id).await
        })
    }

    fn fetch_job<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Job>>> {
        Box::pin(async move {
            if let Some(primary) = &self.primary {
                match primary.fetch_job(id).await {
                    Ok(found @ Some(_)) => return Ok(found),
                    Ok(None) => {}
                    Err(e) => warn!("primary fetch_job failed, using fallback: {e}"),
                }
            }
            self.fallback.fetch_job(id).await
        })
    }

    fn load(&self) -> BoxFuture<'_, Result<PersistedState>> {
        Box::pin(async move {
            if let Some(primary) = &self.primary {
                match primary.load().await {
                    Ok(state) if !state.jobs.is_empty() || !state.queue.is_empty() => {
                        return Ok(state);
                    }
                    Ok(state) => return Ok(state),
                    Err(e) => warn!("primary load failed, using fallback: {e}"),
                }
            }
            self.fallback.load().await
        })
    }
}
