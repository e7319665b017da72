use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::Config;
use crate::error::ApiError;
use crate::oauth::{percent_encode, Credentials, OAuthSigner};

/// Result of an `action=upload` call that did not raise an API error.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Success { filename: String, page_url: String },
    /// Commons refused without `ignorewarnings`; nothing was stored.
    Warning { kinds: Vec<String> },
}

/// MediaWiki Action API client for Wikimedia Commons, signed with an OAuth access token.
pub struct CommonsClient {
    http: Client,
    api_url: Url,
    index_url: String,
    signer: OAuthSigner,
}

impl CommonsClient {
    pub fn new(config: &Config, access_token: Credentials) -> Result<Self, ApiError> {
        let (key, secret) = config.consumer().map_err(|e| ApiError::NotAuthorized(e.to_string()))?;
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(300))
            .build()?;
        let api_url = Url::parse(&format!("{}api.php", config.commons_base))
            .map_err(|e| ApiError::Decode(format!("bad wiki url: {e}")))?;
        Ok(Self {
            http,
            api_url,
            index_url: format!("{}index.php", config.commons_base),
            signer: OAuthSigner::new(Credentials::new(key, secret), Some(access_token)),
        })
    }

    pub fn file_page_url(&self, filename: &str) -> String {
        format!("{}?title={}", self.index_url, percent_encode(&format!("File:{filename}")))
    }

    fn base_params() -> Vec<(String, String)> {
        vec![("format".into(), "json".into()), ("formatversion".into(), "2".into())]
    }

    async fn get(&self, params: &[(&str, &str)]) -> Result<Value, ApiError> {
        let mut url = self.api_url.clone();
        url.query_pairs_mut()
            .extend_pairs(Self::base_params())
            .extend_pairs(params);
        let header = self.signer.authorization_header("GET", &url, &[], &[]);
        let resp = self.http.get(url).header(reqwest::header::AUTHORIZATION, header).send().await?;
        Self::read_json(resp).await
    }

    async fn post_form(&self, params: &[(&str, &str)]) -> Result<Value, ApiError> {
        let mut form = Self::base_params();
        form.extend(params.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        let header = self.signer.authorization_header("POST", &self.api_url, &form, &[]);
        let resp = self
            .http
            .post(self.api_url.clone())
            .header(reqwest::header::AUTHORIZATION, header)
            .form(&form)
            .send()
            .await?;
        Self::read_json(resp).await
    }

    async fn read_json(resp: reqwest::Response) -> Result<Value, ApiError> {
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        if !(200..300).contains(&status) {
            return Err(ApiError::from_status(status, body));
        }
        let value: Value = serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))?;
        if let Some(err) = value.get("error") {
            let code = err.get("code").and_then(Value::as_str).unwrap_or("unknown").to_string();
            let info = err.get("info").and_then(Value::as_str).unwrap_or_default().to_string();
            return Err(match code.as_str() {
                "mwoauth-invalid-authorization" | "mwoauth-invalid-authorization-invalid-user" | "notloggedin" => {
                    ApiError::NotAuthorized(info)
                }
                _ => ApiError::MediaWiki { code, info },
            });
        }
        Ok(value)
    }

    /// Name of the account the access token belongs to.
    #[instrument(skip(self))]
    pub async fn userinfo(&self) -> Result<String, ApiError> {
        let v = self.get(&[("action", "query"), ("meta", "userinfo")]).await?;
        let info = &v["query"]["userinfo"];
        if info.get("anon").is_some() {
            return Err(ApiError::NotAuthorized("access token is not bound to a user".into()));
        }
        info["name"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ApiError::Decode("userinfo without name".into()))
    }

    pub async fn csrf_token(&self) -> Result<String, ApiError> {
        let v = self.get(&[("action", "query"), ("meta", "tokens"), ("type", "csrf")]).await?;
        v["query"]["tokens"]["csrftoken"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ApiError::Decode("missing csrf token".into()))
    }

    async fn file_page(&self, filename: &str) -> Result<Value, ApiError> {
        let title = format!("File:{filename}");
        let v = self.get(&[("action", "query"), ("titles", &title)]).await?;
        Ok(v["query"]["pages"].get(0).cloned().unwrap_or(Value::Null))
    }

    pub async fn file_exists(&self, filename: &str) -> Result<bool, ApiError> {
        let page = self.file_page(filename).await?;
        Ok(!page.is_null() && page.get("missing").is_none() && page.get("invalid").is_none())
    }

    /// Files already on Commons with this SHA-1 (hex).
    #[instrument(skip(self))]
    pub async fn find_duplicates(&self, sha1_hex: &str) -> Result<Vec<String>, ApiError> {
        let v = self
            .get(&[("action", "query"), ("list", "allimages"), ("aisha1", sha1_hex), ("ailimit", "10")])
            .await?;
        Ok(v["query"]["allimages"]
            .as_array()
            .map(|items| items.iter().filter_map(|i| i["name"].as_str().map(str::to_string)).collect())
            .unwrap_or_default())
    }

    async fn upload_once(&self, filename: &str, text: &str, comment: &str, bytes: &[u8], token: &str, ignore: bool) -> Result<Value, ApiError> {
        let mut form = Form::new()
            .text("action", "upload")
            .text("format", "json")
            .text("formatversion", "2")
            .text("filename", filename.to_string())
            .text("text", text.to_string())
            .text("comment", comment.to_string())
            .text("token", token.to_string());
        if ignore {
            form = form.text("ignorewarnings", "1");
        }
        let part = Part::bytes(bytes.to_vec()).file_name(filename.to_string());
        form = form.part("file", part);

        // Multipart bodies are not part of the OAuth signature.
        let header = self.signer.authorization_header("POST", &self.api_url, &[], &[]);
        let resp = self
            .http
            .post(self.api_url.clone())
            .header(reqwest::header::AUTHORIZATION, header)
            .multipart(form)
            .send()
            .await?;
        Self::read_json(resp).await
    }

    /// Upload a file. With `ignore_warnings`, a warned upload is retried with
    /// `ignorewarnings=1` unless one of the warnings is a duplicate.
    #[instrument(skip(self, text, bytes), fields(size = bytes.len()))]
    pub async fn upload(&self, filename: &str, text: &str, comment: &str, bytes: &[u8], ignore_warnings: bool) -> Result<UploadOutcome, ApiError> {
        let token = self.csrf_token().await?;
        let mut v = self.upload_once(filename, text, comment, bytes, &token, false).await?;
        let mut outcome = self.parse_upload(&v, filename)?;
        if let UploadOutcome::Warning { kinds } = &outcome {
            if ignore_warnings && !kinds.iter().any(|k| k == "duplicate") {
                warn!(?kinds, "retrying upload with ignorewarnings");
                v = self.upload_once(filename, text, comment, bytes, &token, true).await?;
                outcome = self.parse_upload(&v, filename)?;
            }
        }
        if let UploadOutcome::Success { page_url, .. } = &outcome {
            info!(%page_url, "uploaded");
        }
        Ok(outcome)
    }

    fn parse_upload(&self, v: &Value, requested: &str) -> Result<UploadOutcome, ApiError> {
        let upload = &v["upload"];
        match upload["result"].as_str() {
            Some("Success") => {
                let filename = upload["filename"].as_str().unwrap_or(requested).to_string();
                let page_url = upload["imageinfo"]["descriptionurl"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| self.file_page_url(&filename));
                Ok(UploadOutcome::Success { filename, page_url })
            }
            Some("Warning") => {
                let mut kinds: Vec<String> = upload["warnings"]
                    .as_object()
                    .map(|w| w.keys().cloned().collect())
                    .unwrap_or_default();
                kinds.sort();
                debug!(?kinds, "upload warnings");
                Ok(UploadOutcome::Warning { kinds })
            }
            other => Err(ApiError::Decode(format!("unexpected upload result: {other:?}"))),
        }
    }

    /// Set the structured-data caption (label) of a file.
    #[instrument(skip(self, text))]
    pub async fn set_caption(&self, filename: &str, language: &str, text: &str) -> Result<(), ApiError> {
        let page = self.file_page(filename).await?;
        let page_id = page["pageid"]
            .as_i64()
            .ok_or_else(|| ApiError::Decode(format!("no page id for File:{filename}")))?;
        let entity = format!("M{page_id}");
        let token = self.csrf_token().await?;
        self.post_form(&[
            ("action", "wbsetlabel"),
            ("id", &entity),
            ("language", language),
            ("value", text),
            ("token", &token),
        ])
        .await?;
        Ok(())
    }
}
