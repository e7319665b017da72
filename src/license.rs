use serde::{Deserialize, Serialize};

const DEFAULT_CC_VERSION: &str = "4.0";

/// A license Commons accepts, with the template that states it on the file page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonsLicense {
    /// License code as DigitaltMuseum wrote it.
    pub source_code: String,
    pub template: String,
}

/// Map a DigitaltMuseum license code to a Commons license template.
///
/// Whitespace and case are ignored, and a trailing version ("4.0", "-3.0", "4")
/// is kept. Returns `None` for anything that is not a free license (NC/ND
/// variants, "copyright", unknown codes).
pub fn commons_license(code: &str) -> Option<CommonsLicense> {
    let compact: String = code.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_ascii_lowercase();
    let body = compact.strip_prefix("cc").unwrap_or(&compact).trim_start_matches('-');

    let template = match split_version(body) {
        _ if is_zero(body) => "{{CC-zero}}".to_string(),
        ("pdm" | "publicdomain" | "publicdomainmark", _) => "{{PDM-owner}}".to_string(),
        ("by", version) => format!("{{{{cc-by-{}}}}}", version.unwrap_or_else(|| DEFAULT_CC_VERSION.to_string())),
        ("by-sa" | "bysa", version) => format!("{{{{cc-by-sa-{}}}}}", version.unwrap_or_else(|| DEFAULT_CC_VERSION.to_string())),
        _ => return None,
    };
    Some(CommonsLicense { source_code: code.trim().to_string(), template })
}

// "0", "zero", "01.0", "0-1.0": CC0 carries its own version number.
fn is_zero(body: &str) -> bool {
    match body.strip_prefix("zero").or_else(|| body.strip_prefix('0')) {
        Some(rest) => {
            let rest = rest.strip_prefix('-').unwrap_or(rest);
            rest.is_empty() || is_version(rest)
        }
        None => false,
    }
}

/// Split "by-sa-4.0" into ("by-sa", Some("4.0")). A bare major version gets ".0".
fn split_version(body: &str) -> (&str, Option<String>) {
    let name = body.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.');
    let version = &body[name.len()..];
    if !is_version(version) {
        return (body, None);
    }
    let name = name.strip_suffix('-').unwrap_or(name);
    let version = if version.contains('.') { version.to_string() } else { format!("{version}.0") };
    (name, Some(version))
}

fn is_version(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

/// First free license of the picture itself, else the artifact's.
pub fn select_license(media_licenses: &[String], artifact_licenses: &[String]) -> Option<CommonsLicense> {
    media_licenses
        .iter()
        .chain(artifact_licenses.iter())
        .find_map(|code| commons_license(code))
}
