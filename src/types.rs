use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::license::CommonsLicense;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Producer {
    pub name: String,
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dating {
    pub from_year: Option<i64>,
    pub to_year: Option<i64>,
}

/// A DigitaltMuseum object record, reduced to what the upload needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub owner: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub licenses: Vec<String>,
    pub producers: Vec<Producer>,
    pub dating: Option<Dating>,
    pub pictures: Vec<String>,
    pub source_url: String,
}

/// Per-picture metadata from the media endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub identifier: String,
    pub licenses: Vec<String>,
    pub mime_type: Option<String>,
}

// --- wire shapes (DiMu JSON); every field optional, `null` reads as absent ---

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawObject {
    identifier: Option<RawIdentifier>,
    title: Option<String>,
    description: Option<String>,
    licenses: Option<Vec<RawLicense>>,
    producers: Option<Vec<RawProducer>>,
    dating: Option<RawDating>,
    media: Option<RawMedia>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawIdentifier {
    id: Option<RawScalar>,
    owner: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLicense {
    Code(String),
    Object { code: String },
    Other(serde_json::Value),
}

impl RawLicense {
    fn into_code(self) -> Option<String> {
        match self {
            RawLicense::Code(c) | RawLicense::Object { code: c } => non_empty(Some(c)),
            RawLicense::Other(_) => None,
        }
    }
}

fn license_codes(raw: Option<Vec<RawLicense>>) -> Vec<String> {
    raw.unwrap_or_default().into_iter().filter_map(RawLicense::into_code).collect()
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawProducer {
    name: Option<String>,
    role: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawDating {
    from_year: Option<RawScalar>,
    to_year: Option<RawScalar>,
}

/// Identifiers and years arrive as strings or numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Num(i64),
    Text(String),
    Other(serde_json::Value),
}

impl RawScalar {
    fn year(&self) -> Option<i64> {
        match self {
            RawScalar::Num(n) => Some(*n),
            RawScalar::Text(s) => s.trim().parse().ok(),
            RawScalar::Other(_) => None,
        }
    }

    fn text(self) -> Option<String> {
        match self {
            RawScalar::Num(n) => Some(n.to_string()),
            RawScalar::Text(s) => non_empty(Some(s)),
            RawScalar::Other(_) => None,
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawMedia {
    pictures: Option<Vec<RawPicture>>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawPicture {
    identifier: Option<RawScalar>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawMediaInfo {
    identifier: Option<RawScalar>,
    licenses: Option<Vec<RawLicense>>,
    mime_type: Option<String>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Artifact {
    /// Build from the DiMu object JSON. `requested_id` is used when the record lacks an identifier.
    pub fn from_json(requested_id: &str, value: &serde_json::Value, public_base: &str) -> Result<Self, serde_json::Error> {
        let raw: RawObject = serde_json::from_value(value.clone())?;
        let identifier = raw.identifier.unwrap_or_default();
        let id = identifier.id.and_then(RawScalar::text).unwrap_or_else(|| requested_id.to_string());
        let dating = raw.dating.and_then(|d| {
            let from_year = d.from_year.as_ref().and_then(RawScalar::year);
            let to_year = d.to_year.as_ref().and_then(RawScalar::year);
            (from_year.is_some() || to_year.is_some()).then_some(Dating { from_year, to_year })
        });
        let pictures = raw.media.and_then(|m| m.pictures).unwrap_or_default();
        Ok(Self {
            source_url: format!("{public_base}{id}"),
            id,
            owner: non_empty(identifier.owner),
            title: non_empty(raw.title).unwrap_or_default(),
            description: non_empty(raw.description),
            licenses: license_codes(raw.licenses),
            producers: raw
                .producers
                .unwrap_or_default()
                .into_iter()
                .filter_map(|p| non_empty(p.name).map(|name| Producer { name, role: non_empty(p.role) }))
                .collect(),
            dating,
            pictures: pictures.into_iter().filter_map(|p| p.identifier.and_then(RawScalar::text)).collect(),
        })
    }
}

impl MediaInfo {
    pub fn from_json(requested_id: &str, value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let raw: RawMediaInfo = serde_json::from_value(value.clone())?;
        Ok(Self {
            identifier: raw.identifier.and_then(RawScalar::text).unwrap_or_else(|| requested_id.to_string()),
            licenses: license_codes(raw.licenses),
            mime_type: non_empty(raw.mime_type),
        })
    }
}

/// Everything needed to put one picture on Commons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadPlan {
    pub artifact_id: String,
    pub media_id: String,
    pub filename: String,
    pub wikitext: String,
    pub caption: String,
    pub license: CommonsLicense,
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlanOutcome {
    Ready(UploadPlan),
    NoFreeLicense { artifact_id: String, media_id: String },
}

impl PlanOutcome {
    pub fn media_id(&self) -> &str {
        match self {
            PlanOutcome::Ready(p) => &p.media_id,
            PlanOutcome::NoFreeLicense { media_id, .. } => media_id,
        }
    }

    pub fn artifact_id(&self) -> &str {
        match self {
            PlanOutcome::Ready(p) => &p.artifact_id,
            PlanOutcome::NoFreeLicense { artifact_id, .. } => artifact_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Uploading,
    Uploaded,
    Duplicate,
    Skipped,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Uploading => "uploading",
            JobStatus::Uploaded => "uploaded",
            JobStatus::Duplicate => "duplicate",
            JobStatus::Skipped => "skipped",
            JobStatus::Failed => "failed",
        }
    }

    /// Terminal jobs are never re-run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Uploaded | JobStatus::Duplicate | JobStatus::Skipped)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.pad(self.as_str()) }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "pending" => JobStatus::Pending,
            "uploading" => JobStatus::Uploading,
            "uploaded" => JobStatus::Uploaded,
            "duplicate" => JobStatus::Duplicate,
            "skipped" => JobStatus::Skipped,
            "failed" => JobStatus::Failed,
            other => anyhow::bail!("unknown job status: {other}"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadJob {
    pub id: String,
    pub artifact_id: String,
    pub media_id: String,
    pub filename: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub page_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}
