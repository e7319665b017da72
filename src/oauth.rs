//! OAuth 1.0a (HMAC-SHA1) signing and the MediaWiki `Special:OAuth` handshake.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use crate::config::Config;
use crate::current_epoch;
use crate::error::ApiError;

type HmacSha1 = Hmac<Sha1>;

/// RFC 5849 §3.6: everything except unreserved characters is encoded.
const OAUTH_ENCODE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

pub fn percent_encode(s: &str) -> String { utf8_percent_encode(s, OAUTH_ENCODE).to_string() }

/// A key/secret pair: consumer, request token or access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub key: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self { key: key.into(), secret: secret.into() }
    }
}

/// Base string URI: scheme and host lowercased, default port dropped, no query.
pub fn normalize_url(url: &Url) -> String {
    let mut out = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default().to_ascii_lowercase());
    if let Some(port) = url.port() {
        out.push_str(&format!(":{port}"));
    }
    out.push_str(url.path());
    out
}

/// Signature base string over the URL's query pairs plus `params` (oauth_* and form fields).
pub fn signature_base_string(method: &str, url: &Url, params: &[(String, String)]) -> String {
    let mut all: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (percent_encode(&k), percent_encode(&v)))
        .collect();
    all.extend(params.iter().map(|(k, v)| (percent_encode(k), percent_encode(v))));
    all.sort();
    let normalized = all.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");
    format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        percent_encode(&normalize_url(url)),
        percent_encode(&normalized)
    )
}

pub fn sign(base_string: &str, consumer_secret: &str, token_secret: &str) -> String {
    let key = format!("{}&{}", percent_encode(consumer_secret), percent_encode(token_secret));
    let mut mac = HmacSha1::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(base_string.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

#[derive(Debug, Clone)]
pub struct OAuthSigner {
    consumer: Credentials,
    token: Option<Credentials>,
}

impl OAuthSigner {
    pub fn new(consumer: Credentials, token: Option<Credentials>) -> Self { Self { consumer, token } }

    /// `Authorization` header value for a request. `form` holds url-encoded body
    /// fields (empty for GET and multipart); `extra` adds protocol parameters such
    /// as `oauth_verifier`.
    pub fn authorization_header(&self, method: &str, url: &Url, form: &[(String, String)], extra: &[(&str, &str)]) -> String {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        self.authorization_header_with(method, url, form, extra, &nonce, current_epoch())
    }

    pub(crate) fn authorization_header_with(
        &self,
        method: &str,
        url: &Url,
        form: &[(String, String)],
        extra: &[(&str, &str)],
        nonce: &str,
        timestamp: i64,
    ) -> String {
        let mut oauth: Vec<(String, String)> = vec![
            ("oauth_consumer_key".into(), self.consumer.key.clone()),
            ("oauth_nonce".into(), nonce.to_string()),
            ("oauth_signature_method".into(), "HMAC-SHA1".into()),
            ("oauth_timestamp".into(), timestamp.to_string()),
            ("oauth_version".into(), "1.0".into()),
        ];
        if let Some(token) = &self.token {
            oauth.push(("oauth_token".into(), token.key.clone()));
        }
        oauth.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));

        let mut params = oauth.clone();
        params.extend(form.iter().cloned());
        let base = signature_base_string(method, url, &params);
        let token_secret = self.token.as_ref().map(|t| t.secret.as_str()).unwrap_or("");
        oauth.push(("oauth_signature".into(), sign(&base, &self.consumer.secret, token_secret)));
        oauth.sort();

        let fields = oauth
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("OAuth {fields}")
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    key: Option<String>,
    secret: Option<String>,
    error: Option<String>,
    message: Option<String>,
}

fn parse_token_response(status: u16, body: &str) -> Result<Credentials, ApiError> {
    let parsed: Option<TokenResponse> = serde_json::from_str(body).ok();
    match parsed {
        Some(TokenResponse { error: Some(code), message, .. }) => {
            Err(ApiError::NotAuthorized(message.map(|m| format!("{code}: {m}")).unwrap_or(code)))
        }
        Some(TokenResponse { key: Some(key), secret: Some(secret), .. }) if (200..300).contains(&status) => {
            Ok(Credentials { key, secret })
        }
        _ if !(200..300).contains(&status) => Err(ApiError::from_status(status, body.to_string())),
        _ => Err(ApiError::Decode(format!("token response without key/secret: {body}"))),
    }
}

/// Client for the three-legged handshake against `Special:OAuth`.
pub struct OAuthClient {
    http: Client,
    index_url: String,
    consumer: Credentials,
    callback: String,
}

impl OAuthClient {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let (key, secret) = config.consumer().map_err(|e| ApiError::NotAuthorized(e.to_string()))?;
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            index_url: format!("{}index.php", config.commons_base),
            consumer: Credentials::new(key, secret),
            callback: config.callback_url.clone(),
        })
    }

    fn special_url(&self, page: &str, pairs: &[(&str, &str)]) -> Result<Url, ApiError> {
        let mut url = Url::parse(&self.index_url).map_err(|e| ApiError::Decode(format!("bad wiki url: {e}")))?;
        url.query_pairs_mut().append_pair("title", &format!("Special:OAuth/{page}")).extend_pairs(pairs);
        Ok(url)
    }

    async fn signed_get(&self, url: Url, token: Option<&Credentials>, extra: &[(&str, &str)]) -> Result<Credentials, ApiError> {
        let signer = OAuthSigner::new(self.consumer.clone(), token.cloned());
        let header = signer.authorization_header("GET", &url, &[], extra);
        let resp = self.http.get(url).header(reqwest::header::AUTHORIZATION, header).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        parse_token_response(status, &body)
    }

    /// Step 1: obtain a request token.
    #[instrument(skip(self))]
    pub async fn request_token(&self) -> Result<Credentials, ApiError> {
        let url = self.special_url("initiate", &[("format", "json"), ("oauth_callback", &self.callback)])?;
        let token = self.signed_get(url, None, &[]).await?;
        debug!("received request token");
        Ok(token)
    }

    /// Step 2: where the user approves the request token.
    pub fn authorize_url(&self, request_token: &Credentials) -> Result<String, ApiError> {
        let url = self.special_url(
            "authorize",
            &[("oauth_token", &request_token.key), ("oauth_consumer_key", &self.consumer.key)],
        )?;
        Ok(url.to_string())
    }

    /// Step 3: trade the approved request token and verifier for an access token.
    #[instrument(skip(self, request_token, verifier))]
    pub async fn access_token(&self, request_token: &Credentials, verifier: &str) -> Result<Credentials, ApiError> {
        let url = self.special_url("token", &[("format", "json")])?;
        self.signed_get(url, Some(request_token), &[("oauth_verifier", verifier.trim())]).await
    }

    pub fn consumer(&self) -> &Credentials { &self.consumer }
}
