use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::AnyPool;

use crate::oauth::Credentials;
use crate::types::{JobStatus, UploadJob};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRow {
    pub id: String,
    pub owner: Option<String>,
    pub title: String,
    pub payload: String, // raw DiMu JSON
    pub fetched_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInsert {
    pub id: String,
    pub artifact_id: String,
    pub media_id: String,
    pub filename: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub now: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Request,
    Access,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Request => "request",
            TokenKind::Access => "access",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredToken {
    pub credentials: Credentials,
    pub username: Option<String>,
}

// The Any driver is picky about NULL text; read optional columns through COALESCE.
fn opt(s: String) -> Option<String> { Some(s).filter(|v| !v.is_empty()) }

type JobTuple = (String, String, String, String, String, String, String, i64, i64);

const JOB_COLUMNS: &str = "id, artifact_id, media_id, filename, status, COALESCE(error, ''), COALESCE(page_url, ''), created_at, updated_at";

fn job_from_row(row: JobTuple) -> Result<UploadJob> {
    let (id, artifact_id, media_id, filename, status, error, page_url, created_at, updated_at) = row;
    Ok(UploadJob {
        id,
        artifact_id,
        media_id,
        filename,
        status: status.parse()?,
        error: opt(error),
        page_url: opt(page_url),
        created_at,
        updated_at,
    })
}

pub async fn upsert_artifact(pool: &AnyPool, a: &ArtifactRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO artifacts(id, owner, title, payload, fetched_at) VALUES(?, ?, ?, ?, ?)\n         ON CONFLICT(id) DO UPDATE SET\n           owner=excluded.owner, title=excluded.title, payload=excluded.payload, fetched_at=excluded.fetched_at",
    )
    .bind(&a.id)
    .bind(&a.owner)
    .bind(&a.title)
    .bind(&a.payload)
    .bind(a.fetched_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_artifact_row(pool: &AnyPool, id: &str) -> Result<Option<ArtifactRow>> {
    let row = sqlx::query_as::<_, (String, String, String, String, i64)>(
        "SELECT id, COALESCE(owner, ''), title, payload, fetched_at FROM artifacts WHERE id = ? LIMIT 1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(id, owner, title, payload, fetched_at)| ArtifactRow { id, owner: opt(owner), title, payload, fetched_at }))
}

/// Insert a job unless one exists for (artifact, media); returns the stored row either way.
pub async fn insert_job_if_absent(pool: &AnyPool, j: &JobInsert) -> Result<UploadJob> {
    sqlx::query(
        "INSERT INTO upload_jobs(id, artifact_id, media_id, filename, status, error, page_url, created_at, updated_at)\n         VALUES(?, ?, ?, ?, ?, ?, NULL, ?, ?)\n         ON CONFLICT(artifact_id, media_id) DO NOTHING",
    )
    .bind(&j.id)
    .bind(&j.artifact_id)
    .bind(&j.media_id)
    .bind(&j.filename)
    .bind(j.status.as_str())
    .bind(&j.error)
    .bind(j.now)
    .bind(j.now)
    .execute(pool)
    .await?;
    find_job(pool, &j.artifact_id, &j.media_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job for {}/{} vanished after insert", j.artifact_id, j.media_id))
}

pub async fn find_job(pool: &AnyPool, artifact_id: &str, media_id: &str) -> Result<Option<UploadJob>> {
    let row = sqlx::query_as::<_, JobTuple>(&format!(
        "SELECT {JOB_COLUMNS} FROM upload_jobs WHERE artifact_id = ? AND media_id = ? LIMIT 1"
    ))
    .bind(artifact_id)
    .bind(media_id)
    .fetch_optional(pool)
    .await?;
    row.map(job_from_row).transpose()
}

pub async fn get_job(pool: &AnyPool, id: &str) -> Result<Option<UploadJob>> {
    let row = sqlx::query_as::<_, JobTuple>(&format!("SELECT {JOB_COLUMNS} FROM upload_jobs WHERE id = ? LIMIT 1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(job_from_row).transpose()
}

pub async fn update_job_status(
    pool: &AnyPool,
    id: &str,
    status: JobStatus,
    error: Option<&str>,
    page_url: Option<&str>,
    now: i64,
) -> Result<UploadJob> {
    sqlx::query("UPDATE upload_jobs SET status = ?, error = ?, page_url = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(error)
        .bind(page_url)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    get_job(pool, id).await?.ok_or_else(|| anyhow::anyhow!("upload job not found: {id}"))
}

pub async fn set_job_filename(pool: &AnyPool, id: &str, filename: &str, now: i64) -> Result<()> {
    sqlx::query("UPDATE upload_jobs SET filename = ?, updated_at = ? WHERE id = ?")
        .bind(filename)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_jobs(pool: &AnyPool, status: Option<JobStatus>) -> Result<Vec<UploadJob>> {
    let rows = if let Some(s) = status {
        sqlx::query_as::<_, JobTuple>(&format!(
            "SELECT {JOB_COLUMNS} FROM upload_jobs WHERE status = ? ORDER BY created_at, artifact_id, media_id"
        ))
        .bind(s.as_str())
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as::<_, JobTuple>(&format!(
            "SELECT {JOB_COLUMNS} FROM upload_jobs ORDER BY created_at, artifact_id, media_id"
        ))
        .fetch_all(pool)
        .await?
    };
    rows.into_iter().map(job_from_row).collect()
}

pub async fn count_jobs_by_status(pool: &AnyPool) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        "SELECT status, COUNT(*) FROM upload_jobs GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn count_artifacts(pool: &AnyPool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM artifacts").fetch_one(pool).await?)
}

pub async fn count_cache_entries(pool: &AnyPool, now: i64) -> Result<(i64, i64)> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM http_cache").fetch_one(pool).await?;
    let expired: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM http_cache WHERE expires_at <= ?")
        .bind(now)
        .fetch_one(pool)
        .await?;
    Ok((total, expired))
}

pub async fn save_token(pool: &AnyPool, kind: TokenKind, creds: &Credentials, username: Option<&str>, now: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO oauth_tokens(kind, token, secret, username, created_at) VALUES(?, ?, ?, ?, ?)\n         ON CONFLICT(kind) DO UPDATE SET\n           token=excluded.token, secret=excluded.secret, username=excluded.username, created_at=excluded.created_at",
    )
    .bind(kind.as_str())
    .bind(&creds.key)
    .bind(&creds.secret)
    .bind(username)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_token(pool: &AnyPool, kind: TokenKind) -> Result<Option<StoredToken>> {
    let row = sqlx::query_as::<_, (String, String, String)>(
        "SELECT token, secret, COALESCE(username, '') FROM oauth_tokens WHERE kind = ? LIMIT 1",
    )
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(key, secret, username)| StoredToken { credentials: Credentials { key, secret }, username: opt(username) }))
}

pub async fn delete_token(pool: &AnyPool, kind: TokenKind) -> Result<u64> {
    let res = sqlx::query("DELETE FROM oauth_tokens WHERE kind = ?")
        .bind(kind.as_str())
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}
