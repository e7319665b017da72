use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sqlx::AnyPool;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::commons::{CommonsClient, UploadOutcome};
use crate::current_epoch;
use crate::dao::{self, JobInsert};
use crate::dimu::DigitaltMuseumClient;
use crate::error::ApiError;
use crate::mapping::match_extension;
use crate::types::{JobStatus, PlanOutcome, UploadJob, UploadPlan};

pub const NO_FREE_LICENSE: &str = "no free license";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadOptions {
    /// Plan and report only; nothing is written to Commons or the database.
    pub dry_run: bool,
    /// Restrict the run to these picture identifiers (empty = all).
    pub media: Vec<String>,
    /// Retry warned uploads with `ignorewarnings`, except duplicates.
    pub ignore_warnings: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadReport {
    pub planned: usize,
    pub uploaded: usize,
    pub duplicate: usize,
    pub skipped: usize,
    pub failed: usize,
    pub jobs: Vec<UploadJob>,
    pub plans: Vec<PlanOutcome>,
}

impl UploadReport {
    fn record(&mut self, job: UploadJob) {
        match job.status {
            JobStatus::Uploaded => self.uploaded += 1,
            JobStatus::Duplicate => self.duplicate += 1,
            JobStatus::Skipped => self.skipped += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Pending | JobStatus::Uploading => {}
        }
        self.jobs.push(job);
    }

    /// Fold another run into this one (used when retrying several artifacts).
    pub fn merge(&mut self, other: UploadReport) {
        self.planned += other.planned;
        self.uploaded += other.uploaded;
        self.duplicate += other.duplicate;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.jobs.extend(other.jobs);
        self.plans.extend(other.plans);
    }
}

// What happened to one picture after the job moved to Uploading.
enum Transfer {
    Uploaded { filename: String, page_url: String },
    Duplicate { page_url: Option<String> },
    Warned { kinds: Vec<String> },
}

/// Runs planned uploads one at a time, recording each picture as an upload job.
pub struct Uploader<'a> {
    pool: &'a AnyPool,
    dimu: &'a DigitaltMuseumClient,
    commons: &'a CommonsClient,
    language: &'a str,
    delay: Duration,
}

impl<'a> Uploader<'a> {
    pub fn new(pool: &'a AnyPool, dimu: &'a DigitaltMuseumClient, commons: &'a CommonsClient, language: &'a str, delay: Duration) -> Self {
        Self { pool, dimu, commons, language, delay }
    }

    #[instrument(skip_all, fields(plans = plans.len(), dry_run = opts.dry_run))]
    pub async fn run(&self, plans: Vec<PlanOutcome>, opts: &UploadOptions) -> Result<UploadReport> {
        if opts.dry_run {
            return Ok(dry_run_report(plans, &opts.media));
        }
        let selected = select_media(plans, &opts.media);
        let mut report = UploadReport { planned: count_ready(&selected), ..Default::default() };

        let mut transferred = false;
        for outcome in &selected {
            let job = match outcome {
                PlanOutcome::NoFreeLicense { artifact_id, media_id } => self.skip_unlicensed(artifact_id, media_id).await?,
                PlanOutcome::Ready(plan) => {
                    let job = dao::insert_job_if_absent(self.pool, &new_job(&plan.artifact_id, &plan.media_id, &plan.filename, JobStatus::Pending, None)).await?;
                    if job.status.is_terminal() {
                        debug!(job = %job.id, status = %job.status, "job already finished");
                        job
                    } else {
                        if transferred && !self.delay.is_zero() {
                            tokio::time::sleep(self.delay).await;
                        }
                        transferred = true;
                        self.process(plan, &job, opts.ignore_warnings).await?
                    }
                }
            };
            report.record(job);
        }
        report.plans = selected;
        info!(
            uploaded = report.uploaded,
            duplicate = report.duplicate,
            skipped = report.skipped,
            failed = report.failed,
            "upload run finished"
        );
        Ok(report)
    }

    async fn skip_unlicensed(&self, artifact_id: &str, media_id: &str) -> Result<UploadJob> {
        let job = dao::insert_job_if_absent(
            self.pool,
            &new_job(artifact_id, media_id, "", JobStatus::Skipped, Some(NO_FREE_LICENSE)),
        )
        .await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        dao::update_job_status(self.pool, &job.id, JobStatus::Skipped, Some(NO_FREE_LICENSE), None, current_epoch()).await
    }

    #[instrument(skip(self, plan, job), fields(media = %plan.media_id, filename = %plan.filename))]
    async fn process(&self, plan: &UploadPlan, job: &UploadJob, ignore_warnings: bool) -> Result<UploadJob> {
        if job.filename != plan.filename {
            dao::set_job_filename(self.pool, &job.id, &plan.filename, current_epoch()).await?;
        }
        dao::update_job_status(self.pool, &job.id, JobStatus::Uploading, None, None, current_epoch()).await?;
        let (status, error, page_url) = match self.transfer(plan, ignore_warnings).await {
            Ok(Transfer::Uploaded { filename, page_url }) => {
                if filename != plan.filename {
                    dao::set_job_filename(self.pool, &job.id, &filename, current_epoch()).await?;
                }
                (JobStatus::Uploaded, None, Some(page_url))
            }
            Ok(Transfer::Duplicate { page_url }) => (JobStatus::Duplicate, None, page_url),
            Ok(Transfer::Warned { kinds }) => (JobStatus::Failed, Some(format!("warning: {}", kinds.join(", "))), None),
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "upload failed");
                (JobStatus::Failed, Some(e.to_string()), None)
            }
        };
        dao::update_job_status(self.pool, &job.id, status, error.as_deref(), page_url.as_deref(), current_epoch()).await
    }

    async fn transfer(&self, plan: &UploadPlan, ignore_warnings: bool) -> Result<Transfer, ApiError> {
        let (bytes, content_type) = self.dimu.download_image(&plan.media_id).await?;
        let sha1 = hex::encode(Sha1::digest(&bytes));
        if let Some(existing) = self.commons.find_duplicates(&sha1).await?.into_iter().next() {
            info!(%existing, "identical file already on Commons");
            return Ok(Transfer::Duplicate { page_url: Some(self.commons.file_page_url(&existing)) });
        }

        let target = match match_extension(&plan.filename, content_type.as_deref()) {
            Some(renamed) => {
                info!(%renamed, content_type = ?content_type, "served image type differs from plan");
                renamed
            }
            None => plan.filename.clone(),
        };
        let comment = format!("Uploaded from DigitaltMuseum artifact {}", plan.artifact_id);
        match self.commons.upload(&target, &plan.wikitext, &comment, &bytes, ignore_warnings).await? {
            UploadOutcome::Success { filename, page_url } => {
                if !plan.caption.is_empty() {
                    if let Err(e) = self.commons.set_caption(&filename, self.language, &plan.caption).await {
                        warn!(error = %e, %filename, "could not set caption");
                    }
                }
                Ok(Transfer::Uploaded { filename, page_url })
            }
            UploadOutcome::Warning { kinds } if kinds.iter().any(|k| k == "duplicate") => {
                Ok(Transfer::Duplicate { page_url: None })
            }
            UploadOutcome::Warning { kinds } => Ok(Transfer::Warned { kinds }),
        }
    }
}

/// Report for a run that only plans: ready pictures count as planned, the rest as skipped.
pub fn dry_run_report(plans: Vec<PlanOutcome>, media: &[String]) -> UploadReport {
    let selected = select_media(plans, media);
    let planned = count_ready(&selected);
    UploadReport { planned, skipped: selected.len() - planned, plans: selected, ..Default::default() }
}

fn count_ready(plans: &[PlanOutcome]) -> usize {
    plans.iter().filter(|p| matches!(p, PlanOutcome::Ready(_))).count()
}

fn select_media(plans: Vec<PlanOutcome>, media: &[String]) -> Vec<PlanOutcome> {
    if media.is_empty() {
        return plans;
    }
    plans.into_iter().filter(|p| media.iter().any(|m| m == p.media_id())).collect()
}

fn new_job(artifact_id: &str, media_id: &str, filename: &str, status: JobStatus, error: Option<&str>) -> JobInsert {
    JobInsert {
        id: uuid::Uuid::new_v4().to_string(),
        artifact_id: artifact_id.to_string(),
        media_id: media_id.to_string(),
        filename: filename.to_string(),
        status,
        error: error.map(str::to_string),
        now: current_epoch(),
    }
}
