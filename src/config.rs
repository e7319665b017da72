use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Deployment profile. Only affects defaults (currently the log filter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Development,
    Production,
}

impl Profile {
    pub fn default_log_filter(&self) -> &'static str {
        match self {
            Profile::Development => "dmcommons=debug,info",
            Profile::Production => "info",
        }
    }
}

impl FromStr for Profile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Profile::Development),
            "production" | "prod" => Ok(Profile::Production),
            other => Err(anyhow!("unknown profile: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub profile: Profile,
    pub dm_api_base: String,
    pub dm_api_key: Option<String>,
    pub dm_media_base: String,
    pub dm_public_base: String,
    pub commons_base: String,
    pub consumer_key: Option<String>,
    pub consumer_secret: Option<String>,
    pub callback_url: String,
    pub database_url: Option<String>,
    pub cache_ttl_secs: i64,
    pub upload_delay_ms: u64,
    pub language: String,
    pub categories: Vec<String>,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: Profile::Development,
            dm_api_base: "https://digitaltmuseum.se/api/1/".to_string(),
            dm_api_key: None,
            dm_media_base: "https://mdc.dimu.org/image/".to_string(),
            dm_public_base: "https://digitaltmuseum.se/".to_string(),
            commons_base: "https://commons.wikimedia.org/w/".to_string(),
            consumer_key: None,
            consumer_secret: None,
            callback_url: "oob".to_string(),
            database_url: None,
            cache_ttl_secs: 24 * 60 * 60,
            upload_delay_ms: 1000,
            language: "nb".to_string(),
            categories: vec!["Uploaded from DigitaltMuseum".to_string()],
            user_agent: concat!("dmcommons/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Config {
    /// Load configuration: optional TOML file (explicit path, else `DMCOMMONS_CONFIG`),
    /// then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("DMCOMMONS_CONFIG").ok().filter(|s| !s.trim().is_empty()).map(PathBuf::from));
        let mut cfg = match file {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.normalize();
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> { Self::load(None) }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file: {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file: {}", path.display()))
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, get: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DMCOMMONS_ENV") { self.profile = v.parse()?; }
        if let Some(v) = get("DM_API_BASE") { self.dm_api_base = v; }
        if let Some(v) = get("DM_API_KEY") { self.dm_api_key = Some(v); }
        if let Some(v) = get("DM_MEDIA_BASE") { self.dm_media_base = v; }
        if let Some(v) = get("DM_PUBLIC_BASE") { self.dm_public_base = v; }
        if let Some(v) = get("WIKIMEDIA_BASE_URL") { self.commons_base = v; }
        if let Some(v) = get("WIKIMEDIA_CONSUMER_KEY") { self.consumer_key = Some(v); }
        if let Some(v) = get("WIKIMEDIA_CONSUMER_SECRET") { self.consumer_secret = Some(v); }
        if let Some(v) = get("OAUTH_CALLBACK_URL") { self.callback_url = v; }
        if let Some(v) = get("DMCOMMONS_DATABASE_URL") { self.database_url = Some(v); }
        if let Some(v) = get("DMCOMMONS_CACHE_TTL_SECS") {
            self.cache_ttl_secs = v.parse().with_context(|| format!("DMCOMMONS_CACHE_TTL_SECS: {v}"))?;
        }
        if let Some(v) = get("DMCOMMONS_UPLOAD_DELAY_MS") {
            self.upload_delay_ms = v.parse().with_context(|| format!("DMCOMMONS_UPLOAD_DELAY_MS: {v}"))?;
        }
        if let Some(v) = get("DMCOMMONS_LANGUAGE") { self.language = v; }
        if let Some(v) = get("DMCOMMONS_CATEGORIES") {
            self.categories = v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
        }
        if let Some(v) = get("DMCOMMONS_USER_AGENT") { self.user_agent = v; }
        Ok(())
    }

    /// Base URLs are joined by string concatenation, so they must end in '/'.
    pub fn normalize(&mut self) {
        for base in [
            &mut self.dm_api_base,
            &mut self.dm_media_base,
            &mut self.dm_public_base,
            &mut self.commons_base,
        ] {
            let trimmed = base.trim().to_string();
            *base = if trimmed.ends_with('/') { trimmed } else { format!("{trimmed}/") };
        }
    }

    /// Consumer credentials, or an error naming the missing variables.
    pub fn consumer(&self) -> Result<(String, String)> {
        match (&self.consumer_key, &self.consumer_secret) {
            (Some(k), Some(s)) => Ok((k.clone(), s.clone())),
            _ => bail!("WIKIMEDIA_CONSUMER_KEY and WIKIMEDIA_CONSUMER_SECRET must be set"),
        }
    }

    /// Config pointing every remote at a single base URL (used by the mock servers in tests).
    #[cfg(test)]
    pub(crate) fn for_base(base: &str) -> Self {
        let mut cfg = Self {
            dm_api_base: format!("{base}/api/1/"),
            dm_media_base: format!("{base}/image/"),
            dm_public_base: "https://digitaltmuseum.se/".to_string(),
            commons_base: format!("{base}/w/"),
            consumer_key: Some("consumer".to_string()),
            consumer_secret: Some("consumer-secret".to_string()),
            upload_delay_ms: 0,
            ..Self::default()
        };
        cfg.normalize();
        cfg
    }
}
