use reqwest::Client;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use crate::config::Config;
use crate::error::ApiError;
use crate::oauth::percent_encode;

/// Read-only client for the DigitaltMuseum API.
#[derive(Clone)]
pub struct DigitaltMuseumClient {
    http: Client,
    base_url: String,
    media_base: String,
    api_key: Option<String>,
}

impl DigitaltMuseumClient {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url: config.dm_api_base.clone(),
            media_base: config.dm_media_base.clone(),
            api_key: config.dm_api_key.clone(),
        })
    }

    #[instrument(skip(self))]
    pub async fn get_artifact(&self, artifact_id: &str) -> Result<serde_json::Value, ApiError> {
        self.get_json(&format!("object/{}", percent_encode(artifact_id))).await
    }

    #[instrument(skip(self))]
    pub async fn get_media(&self, media_id: &str) -> Result<serde_json::Value, ApiError> {
        self.get_json(&format!("media/{}", percent_encode(media_id))).await
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.get(&url);
        if let Some(key) = &self.api_key {
            req = req.query(&[("api.key", key)]);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        debug!(%url, status, bytes = body.len(), "dimu response");
        if !(200..300).contains(&status) {
            return Err(ApiError::from_status(status, body));
        }
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(format!("{url}: {e}")))
    }

    /// Full-size rendition of a picture.
    pub fn image_url(&self, media_id: &str) -> String {
        format!("{}{}?dimension=max", self.media_base, percent_encode(media_id))
    }

    /// Image bytes and the served content type.
    #[instrument(skip(self))]
    pub async fn download_image(&self, media_id: &str) -> Result<(Vec<u8>, Option<String>), ApiError> {
        let resp = self.http.get(self.image_url(media_id)).send().await?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, body));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_string());
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(ApiError::Decode(format!("empty image for media {media_id}")));
        }
        Ok((bytes.to_vec(), content_type))
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn is_dimu_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host.split('.').any(|label| label == "digitaltmuseum") || host == "dimu.org" || host.ends_with(".dimu.org")
}

/// Resolve a bare identifier or a DigitaltMuseum URL to the artifact identifier.
pub fn parse_artifact_ref(input: &str) -> Result<String, ApiError> {
    let trimmed = input.trim();
    if is_identifier(trimmed) {
        return Ok(trimmed.to_string());
    }
    let invalid = || ApiError::InvalidReference(trimmed.to_string());
    let url = Url::parse(trimmed).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || !url.host_str().is_some_and(is_dimu_host) {
        return Err(invalid());
    }
    url.path_segments()
        .and_then(|mut segs| segs.find(|s| !s.is_empty()))
        .filter(|s| is_identifier(s))
        .map(str::to_string)
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockResponse, MockServer};
    use serde_json::json;

    #[test]
    fn parses_bare_ids_and_urls() {
        assert_eq!(parse_artifact_ref(" 021016462063 ").unwrap(), "021016462063");
        assert_eq!(parse_artifact_ref("https://digitaltmuseum.no/021016462063/spinnrokk").unwrap(), "021016462063");
        assert_eq!(parse_artifact_ref("https://digitaltmuseum.se/011023557930/").unwrap(), "011023557930");
        assert_eq!(parse_artifact_ref("http://www.digitaltmuseum.org/0110?x=1").unwrap(), "0110");
        assert_eq!(parse_artifact_ref("https://api.dimu.org/0210").unwrap(), "0210");
    }

    #[test]
    fn rejects_foreign_or_malformed_refs() {
        for bad in ["", "https://example.com/0210", "ftp://digitaltmuseum.no/0210", "https://digitaltmuseum.no/", "a b", "https://digitaltmuseum.no/x%20y"] {
            assert!(matches!(parse_artifact_ref(bad), Err(ApiError::InvalidReference(_))), "{bad}");
        }
    }

    #[tokio::test]
    async fn fetches_object_and_media_json() {
        let server = MockServer::start(|req| match req.path() {
            "/api/1/object/0210" => MockResponse::json(200, json!({"title": "Stol"})),
            "/api/1/media/m1" => MockResponse::json(200, json!({"identifier": "m1"})),
            _ => MockResponse::json(404, json!({"error": "not found"})),
        })
        .await;
        let mut cfg = Config::for_base(server.url());
        cfg.dm_api_key = Some("demo".into());
        let client = DigitaltMuseumClient::new(&cfg).unwrap();

        assert_eq!(client.get_artifact("0210").await.unwrap()["title"], "Stol");
        assert_eq!(client.get_media("m1").await.unwrap()["identifier"], "m1");
        assert_eq!(server.requests()[0].query_param("api.key").as_deref(), Some("demo"));

        let err = client.get_artifact("missing").await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn maps_rate_limit_and_bad_json() {
        let server = MockServer::start(|req| match req.path() {
            "/api/1/object/slow" => MockResponse::json(429, json!({})),
            _ => MockResponse::bytes(200, "text/html", b"<html></html>"),
        })
        .await;
        let client = DigitaltMuseumClient::new(&Config::for_base(server.url())).unwrap();
        assert!(matches!(client.get_artifact("slow").await.unwrap_err(), ApiError::RateLimited));
        assert!(matches!(client.get_artifact("html").await.unwrap_err(), ApiError::Decode(_)));
    }

    #[tokio::test]
    async fn downloads_image_bytes() {
        let server = MockServer::start(|req| match req.path() {
            "/image/m1" if req.query_param("dimension").as_deref() == Some("max") => {
                MockResponse::bytes(200, "image/jpeg; charset=binary", b"\xff\xd8\xffJPEG")
            }
            _ => MockResponse::bytes(404, "text/plain", b"nope"),
        })
        .await;
        let client = DigitaltMuseumClient::new(&Config::for_base(server.url())).unwrap();
        let (bytes, ct) = client.download_image("m1").await.unwrap();
        assert_eq!(bytes, b"\xff\xd8\xffJPEG");
        assert_eq!(ct.as_deref(), Some("image/jpeg"));
        assert!(client.download_image("m2").await.is_err());
    }
}
