//! SQLite persistence + attachment file storage for harvested records.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use prh_core::{Paper, PaperReviewMapping, Review, ReviewStructure};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "prh-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("database io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True when SQLite rejected a row whose foreign key does not resolve,
    /// i.e. a review or mapping that targets an unknown paper.
    pub fn is_referential_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => db.message().contains("FOREIGN KEY"),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Papers,
    Reviews,
    PaperReviewMapping,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Papers => "papers",
            Self::Reviews => "reviews",
            Self::PaperReviewMapping => "paper_review_mapping",
        }
    }
}

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS papers (
        paper_id TEXT PRIMARY KEY,
        title TEXT,
        abstract TEXT,
        authors TEXT,
        venue TEXT,
        year INTEGER,
        submission_text TEXT,
        acceptance_status TEXT,
        license TEXT
    )",
    "CREATE TABLE IF NOT EXISTS reviews (
        review_id TEXT PRIMARY KEY,
        paper_id TEXT NOT NULL REFERENCES papers(paper_id),
        reviewer_id TEXT,
        review_text TEXT,
        review_date TEXT,
        overall_score TEXT,
        confidence_score TEXT,
        review_structure TEXT
    )",
    "CREATE TABLE IF NOT EXISTS paper_review_mapping (
        paper_id TEXT NOT NULL REFERENCES papers(paper_id),
        review_id TEXT NOT NULL REFERENCES reviews(review_id),
        reviewer_role TEXT,
        review_round INTEGER,
        PRIMARY KEY (paper_id, review_id)
    )",
];

const UPSERT_PAPER: &str = "INSERT INTO papers
    (paper_id, title, abstract, authors, venue, year, submission_text, acceptance_status, license)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT(paper_id) DO UPDATE SET
        title = excluded.title,
        abstract = excluded.abstract,
        authors = excluded.authors,
        venue = excluded.venue,
        year = excluded.year,
        submission_text = excluded.submission_text,
        acceptance_status = excluded.acceptance_status,
        license = excluded.license";

const UPSERT_REVIEW: &str = "INSERT INTO reviews
    (review_id, paper_id, reviewer_id, review_text, review_date, overall_score, confidence_score, review_structure)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(review_id) DO UPDATE SET
        paper_id = excluded.paper_id,
        reviewer_id = excluded.reviewer_id,
        review_text = excluded.review_text,
        review_date = excluded.review_date,
        overall_score = excluded.overall_score,
        confidence_score = excluded.confidence_score,
        review_structure = excluded.review_structure";

const UPSERT_MAPPING: &str = "INSERT INTO paper_review_mapping
    (paper_id, review_id, reviewer_role, review_round)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(paper_id, review_id) DO UPDATE SET
        reviewer_role = excluded.reviewer_role,
        review_round = excluded.review_round";

const SELECT_PAPER: &str = "SELECT paper_id, title, abstract, authors, venue, year,
    submission_text, acceptance_status, license FROM papers WHERE paper_id = ?1";

const SELECT_REVIEW: &str = "SELECT review_id, paper_id, reviewer_id, review_text, review_date,
    overall_score, confidence_score, review_structure FROM reviews WHERE review_id = ?1";

fn paper_from_row(row: &SqliteRow) -> Result<Paper, StoreError> {
    Ok(Paper {
        paper_id: row.try_get("paper_id")?,
        title: row.try_get("title")?,
        abstract_text: row.try_get("abstract")?,
        authors: row.try_get("authors")?,
        venue: row.try_get("venue")?,
        year: row.try_get("year")?,
        submission_text: row.try_get("submission_text")?,
        acceptance_status: row.try_get("acceptance_status")?,
        license: row.try_get("license")?,
    })
}

fn review_from_row(row: &SqliteRow) -> Result<Review, StoreError> {
    let structure: String = row.try_get("review_structure")?;
    Ok(Review {
        review_id: row.try_get("review_id")?,
        paper_id: row.try_get("paper_id")?,
        reviewer_id: row.try_get("reviewer_id")?,
        review_text: row.try_get("review_text")?,
        review_date: row.try_get("review_date")?,
        overall_score: row.try_get("overall_score")?,
        confidence_score: row.try_get("confidence_score")?,
        review_structure: ReviewStructure::parse(&structure),
    })
}

/// Handle on the harvest database. Owns a single-connection pool so the run
/// has exactly one writer; the schema is created on open when absent.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating on first run) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let store = Self::connect(options).await?;
        debug!(path = %path.display(), "opened harvest database");
        Ok(store)
    }

    /// Private in-memory database, used by the test suites.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        // One connection, never recycled: a harvest run has exactly one
        // writer, and an in-memory database only survives on one connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Begin the ambient transaction a pipeline stage writes through.
    pub async fn begin(&self) -> Result<StoreTx, StoreError> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
        })
    }

    pub async fn count(&self, table: Table) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool).await?)
    }

    pub async fn get_paper(&self, paper_id: &str) -> Result<Option<Paper>, StoreError> {
        let row = sqlx::query(SELECT_PAPER)
            .bind(paper_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(paper_from_row).transpose()
    }

    pub async fn get_review(&self, review_id: &str) -> Result<Option<Review>, StoreError> {
        let row = sqlx::query(SELECT_REVIEW)
            .bind(review_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(review_from_row).transpose()
    }

    /// All stored paper ids, for per-paper discovery scoping.
    pub async fn paper_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT paper_id FROM papers ORDER BY paper_id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn mapping_exists(
        &self,
        paper_id: &str,
        review_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM paper_review_mapping WHERE paper_id = ?1 AND review_id = ?2)",
        )
        .bind(paper_id)
        .bind(review_id)
        .fetch_one(&self.pool)
        .await?)
    }
}

/// One ambient transaction. Upserts overwrite every non-key column so a
/// later, richer discovery of the same record wins; per-record isolation
/// comes from the named savepoint scope.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTx {
    pub async fn upsert_paper(&mut self, paper: &Paper) -> Result<(), StoreError> {
        sqlx::query(UPSERT_PAPER)
            .bind(&paper.paper_id)
            .bind(&paper.title)
            .bind(&paper.abstract_text)
            .bind(&paper.authors)
            .bind(&paper.venue)
            .bind(paper.year)
            .bind(&paper.submission_text)
            .bind(&paper.acceptance_status)
            .bind(&paper.license)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn upsert_review(&mut self, review: &Review) -> Result<(), StoreError> {
        sqlx::query(UPSERT_REVIEW)
            .bind(&review.review_id)
            .bind(&review.paper_id)
            .bind(&review.reviewer_id)
            .bind(&review.review_text)
            .bind(review.review_date)
            .bind(&review.overall_score)
            .bind(&review.confidence_score)
            .bind(review.review_structure.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn upsert_mapping(&mut self, mapping: &PaperReviewMapping) -> Result<(), StoreError> {
        sqlx::query(UPSERT_MAPPING)
            .bind(&mapping.paper_id)
            .bind(&mapping.review_id)
            .bind(&mapping.reviewer_role)
            .bind(mapping.review_round)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn get_paper(&mut self, paper_id: &str) -> Result<Option<Paper>, StoreError> {
        let row = sqlx::query(SELECT_PAPER)
            .bind(paper_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(paper_from_row).transpose()
    }

    pub async fn paper_exists(&mut self, paper_id: &str) -> Result<bool, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM papers WHERE paper_id = ?1)")
                .bind(paper_id)
                .fetch_one(&mut *self.tx)
                .await?,
        )
    }

    pub async fn review_exists(&mut self, review_id: &str) -> Result<bool, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM reviews WHERE review_id = ?1)")
                .bind(review_id)
                .fetch_one(&mut *self.tx)
                .await?,
        )
    }

    /// Open the per-record scope. Writes after this can be undone with
    /// [`StoreTx::rollback_record`] without touching earlier writes.
    pub async fn begin_record(&mut self) -> Result<(), StoreError> {
        sqlx::query("SAVEPOINT record_scope")
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Keep the current record's writes and close its scope.
    pub async fn commit_record(&mut self) -> Result<(), StoreError> {
        sqlx::query("RELEASE SAVEPOINT record_scope")
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Discard the current record's writes and close its scope.
    pub async fn rollback_record(&mut self) -> Result<(), StoreError> {
        sqlx::query("ROLLBACK TO SAVEPOINT record_scope")
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("RELEASE SAVEPOINT record_scope")
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub already_present: bool,
}

/// Flat directory of binary attachments, one file per paper, named by the
/// paper's display number. Writes go through a temp file and an atomic
/// rename; an attachment already on disk is never clobbered or re-written.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// On-disk location for a paper's attachment.
    pub fn path_for(&self, number: i64) -> PathBuf {
        self.root.join(format!("{number}.pdf"))
    }

    pub async fn contains(&self, number: i64) -> bool {
        fs::try_exists(self.path_for(number)).await.unwrap_or(false)
    }

    pub async fn store_bytes(&self, number: i64, bytes: &[u8]) -> anyhow::Result<StoredAttachment> {
        let content_hash = Self::sha256_hex(bytes);
        let path = self.path_for(number);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating attachment directory {}", self.root.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking attachment path {}", path.display()))?
        {
            return Ok(StoredAttachment {
                content_hash,
                path,
                byte_size: bytes.len(),
                already_present: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = self.root.join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp attachment file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp attachment file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp attachment file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(StoredAttachment {
                content_hash,
                path,
                byte_size: bytes.len(),
                already_present: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredAttachment {
                    content_hash,
                    path,
                    byte_size: bytes.len(),
                    already_present: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp attachment {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }
}
