pub mod commons;
pub mod config;
pub mod dao;
pub mod db;
pub mod dimu;
pub mod error;
pub mod license;
pub mod mapping;
pub mod oauth;
pub mod storage;
pub mod types;
pub mod uploader;

#[cfg(test)]
mod testing;

// --- Library API for embedding ---

/// Convenience re-exports for embedders.
pub mod prelude {
    pub use crate::config::{Config, Profile};
    pub use crate::error::ApiError;
    pub use crate::types::{Artifact, JobStatus, MediaInfo, PlanOutcome, UploadJob, UploadPlan};
    pub use crate::uploader::{UploadOptions, UploadReport};
    pub use crate::{Bridge, LibraryStats};
}

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::commons::CommonsClient;
use crate::config::Config;
use crate::dao::{ArtifactRow, TokenKind};
use crate::db::Database;
use crate::dimu::{parse_artifact_ref, DigitaltMuseumClient};
use crate::error::ApiError;
use crate::oauth::OAuthClient;
use crate::storage::Storage;
use crate::types::{Artifact, JobStatus, MediaInfo, PlanOutcome, UploadJob};
use crate::uploader::{UploadOptions, UploadReport, Uploader};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryStats {
    pub artifacts: usize,
    pub jobs_by_status: BTreeMap<String, usize>,
    pub cache_entries: usize,
    pub expired_cache_entries: usize,
    pub authorized_as: Option<String>,
}

/// Async library entry point. Owns the database, the configuration and the museum client.
pub struct Bridge {
    config: Config,
    db: Database,
    dimu: DigitaltMuseumClient,
}

impl Bridge {
    /// Open the database and (optionally) run migrations.
    pub async fn connect(config: Config, run_migrations: bool) -> Result<Self> {
        let db = Database::connect(config.database_url.as_deref()).await?;
        if run_migrations { db.run_migrations().await?; }
        let dimu = DigitaltMuseumClient::new(&config)?;
        Ok(Self { config, db, dimu })
    }

    pub fn config(&self) -> &Config { &self.config }
    pub fn database(&self) -> &Database { &self.db }

    // Read-through JSON cache keyed like `dimu|object|{id}`.
    async fn cached_json<F>(&self, key: &str, refresh: bool, fetch: F) -> Result<serde_json::Value>
    where
        F: Future<Output = Result<serde_json::Value, ApiError>>,
    {
        let now = current_epoch();
        if !refresh {
            if let Some(payload) = self.db.get_cache(key, now).await.ok().flatten() {
                if let Ok(value) = serde_json::from_str(&payload) {
                    debug!(key, "cache hit");
                    return Ok(value);
                }
            }
        }
        let value = fetch.await?;
        let _ = self.db.put_cache(key, &value.to_string(), now.saturating_add(self.config.cache_ttl_secs)).await;
        Ok(value)
    }

    /// Fetch an artifact by id or DigitaltMuseum URL; the record is cached and stored.
    #[instrument(skip(self))]
    pub async fn fetch_artifact(&self, reference: &str, refresh: bool) -> Result<Artifact> {
        let id = parse_artifact_ref(reference)?;
        let key = format!("dimu|object|{id}");
        let value = self.cached_json(&key, refresh, self.dimu.get_artifact(&id)).await?;
        let artifact = Artifact::from_json(&id, &value, &self.config.dm_public_base)
            .with_context(|| format!("artifact {id} has an unexpected shape"))?;

        let row = ArtifactRow {
            id: artifact.id.clone(),
            owner: artifact.owner.clone(),
            title: artifact.title.clone(),
            payload: value.to_string(),
            fetched_at: current_epoch(),
        };
        dao::upsert_artifact(self.db.pool(), &row).await?;
        Ok(artifact)
    }

    /// Per-picture metadata (license, mime type), cached like artifacts.
    pub async fn fetch_media(&self, media_id: &str, refresh: bool) -> Result<MediaInfo> {
        let key = format!("dimu|media|{media_id}");
        let value = self.cached_json(&key, refresh, self.dimu.get_media(media_id)).await?;
        MediaInfo::from_json(media_id, &value).with_context(|| format!("media {media_id} has an unexpected shape"))
    }

    // Pictures whose metadata cannot be read fall back to the artifact's licenses.
    async fn media_for(&self, artifact: &Artifact, refresh: bool) -> Vec<MediaInfo> {
        let lookups = artifact.pictures.iter().map(|id| self.fetch_media(id, refresh));
        futures::future::join_all(lookups)
            .await
            .into_iter()
            .zip(&artifact.pictures)
            .filter_map(|(res, id)| match res {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(media = %id, error = %e, "media metadata unavailable");
                    None
                }
            })
            .collect()
    }

    async fn plan(&self, artifact: &Artifact, refresh: bool) -> Vec<PlanOutcome> {
        let medias = self.media_for(artifact, refresh).await;
        mapping::plan_uploads(artifact, &medias, &self.config, |id| self.dimu.image_url(id))
    }

    /// What an upload of this artifact would do, without touching Commons.
    pub async fn preview(&self, reference: &str) -> Result<Vec<PlanOutcome>> {
        let artifact = self.fetch_artifact(reference, false).await?;
        Ok(self.plan(&artifact, false).await)
    }

    async fn commons_client(&self) -> Result<CommonsClient> {
        let stored = dao::load_token(self.db.pool(), TokenKind::Access)
            .await?
            .ok_or_else(|| ApiError::NotAuthorized("no access token stored; run `auth begin` first".into()))?;
        Ok(CommonsClient::new(&self.config, stored.credentials)?)
    }

    fn uploader<'a>(&'a self, commons: &'a CommonsClient) -> Uploader<'a> {
        Uploader::new(
            self.db.pool(),
            &self.dimu,
            commons,
            &self.config.language,
            Duration::from_millis(self.config.upload_delay_ms),
        )
    }

    /// Upload every freely licensed picture of an artifact.
    #[instrument(skip(self, opts))]
    pub async fn upload(&self, reference: &str, opts: UploadOptions) -> Result<UploadReport> {
        if opts.dry_run {
            let artifact = self.fetch_artifact(reference, false).await?;
            let plans = self.plan(&artifact, false).await;
            return Ok(uploader::dry_run_report(plans, &opts.media));
        }
        let commons = self.commons_client().await?;
        let artifact = self.fetch_artifact(reference, false).await?;
        let plans = self.plan(&artifact, false).await;
        info!(artifact = %artifact.id, pictures = plans.len(), "uploading");
        self.uploader(&commons).run(plans, &opts).await
    }

    /// Re-run every failed job, one artifact at a time.
    pub async fn retry_failed(&self) -> Result<UploadReport> {
        let failed = dao::list_jobs(self.db.pool(), Some(JobStatus::Failed)).await?;
        let mut report = UploadReport::default();
        if failed.is_empty() {
            return Ok(report);
        }
        let commons = self.commons_client().await?;

        let mut by_artifact: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for job in failed {
            by_artifact.entry(job.artifact_id).or_default().push(job.media_id);
        }
        for (artifact_id, media) in by_artifact {
            let artifact = match self.fetch_artifact(&artifact_id, false).await {
                Ok(a) => a,
                Err(e) => {
                    warn!(artifact = %artifact_id, error = %e, "cannot retry; artifact unavailable");
                    continue;
                }
            };
            let plans = self.plan(&artifact, false).await;
            let opts = UploadOptions { media, ..Default::default() };
            report.merge(self.uploader(&commons).run(plans, &opts).await?);
        }
        Ok(report)
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<UploadJob>> {
        dao::list_jobs(self.db.pool(), status).await
    }

    // --- OAuth ---

    /// Start the handshake: stores a request token and returns the URL the user must visit.
    pub async fn begin_auth(&self) -> Result<String> {
        let client = OAuthClient::new(&self.config)?;
        let request = client.request_token().await?;
        dao::save_token(self.db.pool(), TokenKind::Request, &request, None, current_epoch()).await?;
        Ok(client.authorize_url(&request)?)
    }

    /// Finish the handshake with the verifier shown after approval. Returns the user name.
    pub async fn complete_auth(&self, verifier: &str) -> Result<String> {
        let pool = self.db.pool();
        let request = dao::load_token(pool, TokenKind::Request)
            .await?
            .ok_or_else(|| anyhow!("no authorization in progress; run `auth begin` first"))?;
        let client = OAuthClient::new(&self.config)?;
        let access = client.access_token(&request.credentials, verifier).await?;
        let username = CommonsClient::new(&self.config, access.clone())?.userinfo().await?;

        dao::save_token(pool, TokenKind::Access, &access, Some(&username), current_epoch()).await?;
        dao::delete_token(pool, TokenKind::Request).await?;
        info!(%username, "authorized");
        Ok(username)
    }

    /// Name of the authorized Commons account, if any.
    pub async fn auth_status(&self) -> Result<Option<String>> {
        let token = dao::load_token(self.db.pool(), TokenKind::Access).await?;
        Ok(token.map(|t| t.username.unwrap_or_else(|| "(unknown user)".to_string())))
    }

    /// Forget all stored tokens. Returns true if an access token was removed.
    pub async fn logout(&self) -> Result<bool> {
        let pool = self.db.pool();
        dao::delete_token(pool, TokenKind::Request).await?;
        Ok(dao::delete_token(pool, TokenKind::Access).await? > 0)
    }

    // --- Housekeeping ---

    pub async fn stats(&self) -> Result<LibraryStats> {
        let pool = self.db.pool();
        let artifacts = dao::count_artifacts(pool).await?;
        let jobs_by_status = dao::count_jobs_by_status(pool)
            .await?
            .into_iter()
            .map(|(status, n)| (status, n as usize))
            .collect();
        let (cache_entries, expired) = dao::count_cache_entries(pool, current_epoch()).await?;
        Ok(LibraryStats {
            artifacts: artifacts as usize,
            jobs_by_status,
            cache_entries: cache_entries as usize,
            expired_cache_entries: expired as usize,
            authorized_as: self.auth_status().await?,
        })
    }

    pub async fn clear_cache_prefix(&self, prefix: Option<&str>) -> Result<u64> {
        self.db.clear_cache_prefix(prefix).await
    }

    pub async fn purge_expired_cache(&self) -> Result<u64> {
        self.db.purge_expired_cache(current_epoch()).await
    }

    pub async fn vacuum_db(&self) -> Result<()> { self.db.vacuum().await }
}

pub(crate) fn current_epoch() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::Credentials;
    use crate::testing::{MockResponse, MockServer, RecordedRequest};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn bridge(server: &MockServer) -> (Bridge, tempfile::TempDir) {
        bridge_with(server, |_| {}).await
    }

    async fn bridge_with(server: &MockServer, tweak: impl FnOnce(&mut Config)) -> (Bridge, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::for_base(server.url());
        cfg.database_url = Some(format!("sqlite://{}?mode=rwc", dir.path().join("bridge.db").display()));
        tweak(&mut cfg);
        (Bridge::connect(cfg, true).await.unwrap(), dir)
    }

    async fn authorize(bridge: &Bridge) {
        dao::save_token(bridge.database().pool(), TokenKind::Access, &Credentials::new("ak", "as"), Some("Uploader"), current_epoch())
            .await
            .unwrap();
    }

    fn object() -> serde_json::Value {
        json!({
            "identifier": {"id": "0210", "owner": "S-NM"},
            "title": "Stol",
            "licenses": ["CC by-nc"],
            "media": {"pictures": [{"identifier": "m1"}, {"identifier": "m2"}]}
        })
    }

    fn museum(req: &RecordedRequest) -> Option<MockResponse> {
        Some(match req.path() {
            "/api/1/object/0210" => MockResponse::json(200, object()),
            "/api/1/media/m1" => MockResponse::json(200, json!({"identifier": "m1", "licenses": ["CC0"], "mimeType": "image/png"})),
            "/api/1/media/m2" => MockResponse::json(404, json!({})),
            _ => return None,
        })
    }

    #[tokio::test]
    async fn artifacts_are_cached_and_stored() {
        let server = MockServer::start(|req| museum(req).unwrap_or_else(|| MockResponse::json(404, json!({})))).await;
        let (bridge, _dir) = bridge(&server).await;

        let a = bridge.fetch_artifact("https://digitaltmuseum.no/0210/stol", false).await.unwrap();
        assert_eq!(a.title, "Stol");
        bridge.fetch_artifact("0210", false).await.unwrap();
        assert_eq!(server.requests_to("/api/1/object/0210").len(), 1);
        bridge.fetch_artifact("0210", true).await.unwrap();
        assert_eq!(server.requests_to("/api/1/object/0210").len(), 2);

        let row = dao::get_artifact_row(bridge.database().pool(), "0210").await.unwrap().unwrap();
        assert_eq!(row.owner.as_deref(), Some("S-NM"));

        let stats = bridge.stats().await.unwrap();
        assert_eq!(stats.artifacts, 1);
        assert_eq!(stats.cache_entries, 1);
        assert!(stats.authorized_as.is_none());

        assert_eq!(bridge.clear_cache_prefix(Some("dimu|object|")).await.unwrap(), 1);
        assert!(bridge.fetch_artifact("https://example.com/0210", false).await.is_err());
    }

    #[tokio::test]
    async fn huge_cache_ttl_does_not_overflow() {
        let server = MockServer::start(|req| museum(req).unwrap_or_else(|| MockResponse::json(404, json!({})))).await;
        let (bridge, _dir) = bridge_with(&server, |cfg| cfg.cache_ttl_secs = i64::MAX).await;

        bridge.fetch_artifact("0210", false).await.unwrap();
        bridge.fetch_artifact("0210", false).await.unwrap();
        assert_eq!(server.requests_to("/api/1/object/0210").len(), 1);
    }

    #[tokio::test]
    async fn preview_uses_media_licenses_with_artifact_fallback() {
        let server = MockServer::start(|req| museum(req).unwrap_or_else(|| MockResponse::json(404, json!({})))).await;
        let (bridge, _dir) = bridge(&server).await;

        let plans = bridge.preview("0210").await.unwrap();
        assert_eq!(plans.len(), 2);
        match &plans[0] {
            PlanOutcome::Ready(p) => {
                assert_eq!(p.filename, "Stol - S-NM - 0210 - 1.png");
                assert_eq!(p.image_url, format!("{}/image/m1?dimension=max", server.url()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&plans[1], PlanOutcome::NoFreeLicense { media_id, .. } if media_id == "m2"));
    }

    #[tokio::test]
    async fn upload_requires_authorization_first() {
        let server = MockServer::start(|req| museum(req).unwrap_or_else(|| MockResponse::json(404, json!({})))).await;
        let (bridge, _dir) = bridge(&server).await;

        let err = bridge.upload("0210", UploadOptions::default()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ApiError>(), Some(ApiError::NotAuthorized(_))));
        assert!(server.requests().is_empty());

        let dry = bridge.upload("0210", UploadOptions { dry_run: true, ..Default::default() }).await.unwrap();
        assert_eq!((dry.planned, dry.skipped), (1, 1));
        assert!(bridge.list_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oauth_handshake_stores_access_token() {
        let server = MockServer::start(|req| match (req.path(), req.query_param("title").as_deref()) {
            ("/w/index.php", Some("Special:OAuth/initiate")) => MockResponse::json(200, json!({"key": "rk", "secret": "rs"})),
            ("/w/index.php", Some("Special:OAuth/token")) => MockResponse::json(200, json!({"key": "ak", "secret": "as"})),
            ("/w/api.php", _) => MockResponse::json(200, json!({"query": {"userinfo": {"id": 7, "name": "Uploader"}}})),
            _ => MockResponse::json(404, json!({})),
        })
        .await;
        let (bridge, _dir) = bridge(&server).await;

        assert!(bridge.complete_auth("123").await.is_err());
        let url = bridge.begin_auth().await.unwrap();
        assert!(url.contains("oauth_token=rk"));

        assert_eq!(bridge.complete_auth(" 123 ").await.unwrap(), "Uploader");
        assert_eq!(bridge.auth_status().await.unwrap().as_deref(), Some("Uploader"));
        let pool = bridge.database().pool();
        assert!(dao::load_token(pool, TokenKind::Request).await.unwrap().is_none());
        assert_eq!(
            dao::load_token(pool, TokenKind::Access).await.unwrap().unwrap().credentials,
            Credentials::new("ak", "as")
        );

        assert!(bridge.logout().await.unwrap());
        assert!(!bridge.logout().await.unwrap());
        assert!(bridge.auth_status().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_jobs_can_be_retried() {
        let downloads = Arc::new(AtomicUsize::new(0));
        let counter = downloads.clone();
        let server = MockServer::start(move |req| {
            if let Some(resp) = museum(req) {
                return resp;
            }
            match req.path() {
                "/image/m1" => {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        MockResponse::bytes(503, "text/plain", b"busy")
                    } else {
                        MockResponse::bytes(200, "image/png", b"PNG")
                    }
                }
                "/w/api.php" if req.is_multipart() => MockResponse::json(200, json!({"upload": {"result": "Success"}})),
                "/w/api.php" if req.query_param("meta").as_deref() == Some("tokens") => {
                    MockResponse::json(200, json!({"query": {"tokens": {"csrftoken": "t"}}}))
                }
                "/w/api.php" if req.query_param("list").as_deref() == Some("allimages") => {
                    MockResponse::json(200, json!({"query": {"allimages": []}}))
                }
                // caption lookups fail; the upload still counts
                _ => MockResponse::json(500, json!({})),
            }
        })
        .await;
        let (bridge, _dir) = bridge(&server).await;
        authorize(&bridge).await;

        let first = bridge.upload("0210", UploadOptions::default()).await.unwrap();
        assert_eq!((first.failed, first.skipped, first.uploaded), (1, 1, 0));

        let retried = bridge.retry_failed().await.unwrap();
        assert_eq!(retried.uploaded, 1);
        assert_eq!(retried.jobs.len(), 1);
        assert_eq!(bridge.list_jobs(Some(JobStatus::Failed)).await.unwrap().len(), 0);
        assert_eq!(bridge.list_jobs(Some(JobStatus::Uploaded)).await.unwrap().len(), 1);

        let again = bridge.retry_failed().await.unwrap();
        assert!(again.jobs.is_empty());
        let stats = bridge.stats().await.unwrap();
        assert_eq!(stats.jobs_by_status.get("uploaded"), Some(&1));
        assert_eq!(stats.authorized_as.as_deref(), Some("Uploader"));
    }

    #[tokio::test]
    async fn served_image_type_decides_the_extension() {
        let server = MockServer::start(|req| match req.path() {
            "/api/1/object/0210" => MockResponse::json(200, json!({
                "identifier": {"id": "0210", "owner": "S-NM"},
                "title": "Stol",
                "licenses": ["CC by"],
                "media": {"pictures": [{"identifier": "m1"}]}
            })),
            "/image/m1" => MockResponse::bytes(200, "image/png", b"\x89PNG"),
            "/w/api.php" if req.is_multipart() => MockResponse::json(200, json!({"upload": {"result": "Success", "filename": "Stol_-_S-NM_-_0210.png"}})),
            "/w/api.php" if req.query_param("meta").as_deref() == Some("tokens") => {
                MockResponse::json(200, json!({"query": {"tokens": {"csrftoken": "t"}}}))
            }
            "/w/api.php" if req.query_param("list").as_deref() == Some("allimages") => {
                MockResponse::json(200, json!({"query": {"allimages": []}}))
            }
            _ => MockResponse::json(404, json!({})),
        })
        .await;
        let (bridge, _dir) = bridge(&server).await;
        authorize(&bridge).await;

        let plans = bridge.preview("0210").await.unwrap();
        assert!(matches!(&plans[0], PlanOutcome::Ready(p) if p.filename == "Stol - S-NM - 0210.jpg"));

        let report = bridge.upload("0210", UploadOptions::default()).await.unwrap();
        assert_eq!(report.uploaded, 1);
        let upload = server.requests().into_iter().find(|r| r.is_multipart()).unwrap();
        assert!(upload.body_text().contains("Stol - S-NM - 0210.png"));
        assert!(!upload.body_text().contains("0210.jpg"));
        assert_eq!(report.jobs[0].filename, "Stol_-_S-NM_-_0210.png");
    }
}
