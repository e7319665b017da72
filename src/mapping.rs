use crate::config::Config;
use crate::license::{select_license, CommonsLicense};
use crate::types::{Artifact, MediaInfo, PlanOutcome, UploadPlan};

const MAX_FILENAME_BYTES: usize = 240;
// Room kept for the longest extension (".webp") so it can be swapped later.
const MAX_EXTENSION_BYTES: usize = 5;
const MAX_ID_BYTES: usize = 100;
const MIN_TITLE_BYTES: usize = 40;
const MAX_CAPTION_CHARS: usize = 250;
const FORBIDDEN: &[char] = &['#', '<', '>', '[', ']', '|', '{', '}', '/', ':', '\\'];

fn image_extension(mime: &str) -> Option<&'static str> {
    match mime.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/tiff" => Some("tif"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

fn extension_for(mime: Option<&str>) -> &'static str {
    mime.and_then(image_extension).unwrap_or("jpg")
}

/// The file name with its extension replaced when the served image type says otherwise.
pub fn match_extension(filename: &str, content_type: Option<&str>) -> Option<String> {
    let ext = content_type.and_then(image_extension)?;
    let (stem, current) = filename.rsplit_once('.')?;
    (!current.eq_ignore_ascii_case(ext)).then(|| format!("{stem}.{ext}"))
}

/// Replace characters MediaWiki refuses in titles and collapse whitespace.
pub fn sanitize_title_part(s: &str) -> String {
    let replaced: String = s
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .map(|c| if FORBIDDEN.contains(&c) { '-' } else { c })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max { return s; }
    let mut end = max;
    while !s.is_char_boundary(end) { end -= 1; }
    s[..end].trim_end()
}

/// Target file name on Commons: "{title} - {owner} - {id}[ - n].ext", at most 240 bytes.
pub fn commons_filename(artifact: &Artifact, index: usize, total: usize, mime: Option<&str>) -> String {
    let mut tail = format!(" - {}", truncate_bytes(&sanitize_title_part(&artifact.id), MAX_ID_BYTES));
    if total > 1 {
        tail.push_str(&format!(" - {}", index + 1));
    }
    let room = MAX_FILENAME_BYTES - MAX_EXTENSION_BYTES - tail.len();

    let owner = artifact
        .owner
        .as_deref()
        .map(sanitize_title_part)
        .filter(|o| !o.is_empty())
        .map(|o| format!(" - {}", truncate_bytes(&o, room - MIN_TITLE_BYTES - 3)))
        .unwrap_or_default();

    let title = sanitize_title_part(&artifact.title);
    let title = truncate_bytes(&title, room - owner.len());
    let title = if title.is_empty() { "Untitled" } else { title };
    format!("{title}{owner}{tail}.{}", extension_for(mime))
}

/// Values land inside template parameters; a bare pipe would split them.
fn escape_param(s: &str) -> String { s.replace('|', "{{!}}") }

fn date_text(artifact: &Artifact) -> String {
    match artifact.dating.as_ref().map(|d| (d.from_year, d.to_year)) {
        Some((Some(a), Some(b))) if a == b => a.to_string(),
        Some((Some(a), Some(b))) => format!("{a}–{b}"),
        Some((Some(y), None)) | Some((None, Some(y))) => y.to_string(),
        _ => "{{unknown|date}}".to_string(),
    }
}

fn author_text(artifact: &Artifact) -> String {
    if artifact.producers.is_empty() {
        return "{{unknown|author}}".to_string();
    }
    artifact
        .producers
        .iter()
        .map(|p| match &p.role {
            Some(role) => format!("{} ({})", escape_param(&p.name), escape_param(role)),
            None => escape_param(&p.name),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// File description page for one picture.
pub fn wikitext(artifact: &Artifact, license: &CommonsLicense, config: &Config) -> String {
    let description = artifact
        .description
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or(&artifact.title);
    let source = match &artifact.owner {
        Some(owner) => format!("{} (DigitaltMuseum, {})", artifact.source_url, escape_param(owner)),
        None => format!("{} (DigitaltMuseum)", artifact.source_url),
    };

    let mut out = String::new();
    out.push_str("=={{int:filedesc}}==\n");
    out.push_str("{{Information\n");
    out.push_str(&format!("|description={{{{{}|1={}}}}}\n", config.language, escape_param(description)));
    out.push_str(&format!("|date={}\n", date_text(artifact)));
    out.push_str(&format!("|source={source}\n"));
    out.push_str(&format!("|author={}\n", author_text(artifact)));
    out.push_str("|permission=\n");
    out.push_str("|other versions=\n");
    out.push_str("}}\n\n");
    out.push_str("=={{int:license-header}}==\n");
    out.push_str(&license.template);
    out.push_str("\n\n");
    for cat in &config.categories {
        out.push_str(&format!("[[Category:{cat}]]\n"));
    }
    out
}

pub fn caption(artifact: &Artifact) -> String {
    artifact.title.chars().take(MAX_CAPTION_CHARS).collect()
}

/// One outcome per picture, in the artifact's picture order.
pub fn plan_uploads(artifact: &Artifact, medias: &[MediaInfo], config: &Config, image_url: impl Fn(&str) -> String) -> Vec<PlanOutcome> {
    let total = artifact.pictures.len();
    artifact
        .pictures
        .iter()
        .enumerate()
        .map(|(index, media_id)| {
            let media = medias.iter().find(|m| &m.identifier == media_id);
            let media_licenses = media.map(|m| m.licenses.as_slice()).unwrap_or(&[]);
            match select_license(media_licenses, &artifact.licenses) {
                None => PlanOutcome::NoFreeLicense { artifact_id: artifact.id.clone(), media_id: media_id.clone() },
                Some(license) => PlanOutcome::Ready(UploadPlan {
                    artifact_id: artifact.id.clone(),
                    media_id: media_id.clone(),
                    filename: commons_filename(artifact, index, total, media.and_then(|m| m.mime_type.as_deref())),
                    wikitext: wikitext(artifact, &license, config),
                    caption: caption(artifact),
                    image_url: image_url(media_id),
                    license,
                }),
            }
        })
        .collect()
}
