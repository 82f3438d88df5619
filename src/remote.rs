//! Blocking client for the upstream school REST backend.
//!
//! Every request carries the bearer token of an injected
//! [`CredentialProvider`]. There are no retries; a failed call surfaces as a
//! [`RemoteError`] that the IPC layer turns into a `remote_*` error code.

use reqwest::blocking::Client;
use reqwest::header::ACCEPT;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const ENV_TOKEN: &str = "RAPORD_TOKEN";

const MAX_ERROR_BODY: usize = 512;

pub trait CredentialProvider {
    fn bearer_token(&self) -> Option<String>;
}

pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.trim().is_empty()))
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialProvider for EnvToken {
    fn bearer_token(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialProvider for TokenFile {
    fn bearer_token(&self) -> Option<String> {
        std::fs::read_to_string(&self.path)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// First provider with a token wins.
#[derive(Default)]
pub struct CredentialChain {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl CredentialChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }
}

impl CredentialProvider for CredentialChain {
    fn bearer_token(&self) -> Option<String> {
        self.providers.iter().find_map(|p| p.bearer_token())
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote base url is not configured")]
    NotConfigured,
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16, body: String },
    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl RemoteError {
    pub fn code(&self) -> &'static str {
        match self {
            RemoteError::NotConfigured => "remote_not_configured",
            RemoteError::Network { .. } => "remote_network",
            RemoteError::Status { .. } => "remote_status",
            RemoteError::Decode { .. } => "remote_decode",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            RemoteError::NotConfigured => None,
            RemoteError::Network { url, .. } => Some(json!({ "url": url })),
            RemoteError::Status { url, status, body } => {
                Some(json!({ "url": url, "status": status, "body": body }))
            }
            RemoteError::Decode { url, .. } => Some(json!({ "url": url })),
        }
    }
}

pub struct ApiClient {
    base_url: String,
    http: Client,
    credentials: Box<dyn CredentialProvider>,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        timeout: Option<Duration>,
        credentials: Box<dyn CredentialProvider>,
    ) -> Result<Self, RemoteError> {
        let base = base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(RemoteError::NotConfigured);
        }
        let mut builder = Client::builder();
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        let http = builder.build().map_err(|e| RemoteError::Network {
            url: base.to_string(),
            source: e,
        })?;
        Ok(Self {
            base_url: base.to_string(),
            http,
            credentials,
        })
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn get_json(&self, path: &str) -> Result<serde_json::Value, RemoteError> {
        let url = self.url_for(path);
        let mut rb = self.http.get(&url).header(ACCEPT, "application/json");
        if let Some(token) = self.credentials.bearer_token() {
            rb = rb.bearer_auth(token);
        }
        debug!(%url, "GET");
        let resp = rb.send().map_err(|e| RemoteError::Network {
            url: url.clone(),
            source: e,
        })?;
        let status = resp.status();
        if !status.is_success() {
            let mut body = resp.text().unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(RemoteError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }
        let text = resp.text().map_err(|e| RemoteError::Network {
            url: url.clone(),
            source: e,
        })?;
        serde_json::from_str(&text).map_err(|e| RemoteError::Decode {
            url,
            message: e.to_string(),
        })
    }

    /// GET a collection. Accepts a bare array or `{ "data": [...] }`.
    pub fn get_list(&self, path: &str) -> Result<Vec<serde_json::Value>, RemoteError> {
        let v = self.get_json(path)?;
        unwrap_list(v).map_err(|message| RemoteError::Decode {
            url: self.url_for(path),
            message,
        })
    }
}

pub fn unwrap_list(v: serde_json::Value) -> Result<Vec<serde_json::Value>, String> {
    match v {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Object(mut map) => match map.remove("data") {
            Some(serde_json::Value::Array(items)) => Ok(items),
            _ => Err("expected an array or an object with a data array".to_string()),
        },
        _ => Err("expected an array or an object with a data array".to_string()),
    }
}

/// First present key among `keys`, as a string. Numeric ids are stringified.
pub fn field_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match v.get(*k) {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// First of `keys` present on `v`, an explicit `null` included.
pub fn first_present<'a>(v: &'a serde_json::Value, keys: &[&str]) -> Option<&'a serde_json::Value> {
    keys.iter().find_map(|k| v.get(*k))
}

pub fn number_of(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn field_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| v.get(*k).and_then(number_of))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_returns_first_available_token() {
        let chain = CredentialChain::new()
            .with(StaticToken::new(None))
            .with(StaticToken::new(Some("  ".into())))
            .with(StaticToken::new(Some("persisted".into())))
            .with(StaticToken::new(Some("fallback".into())));
        assert_eq!(chain.bearer_token().as_deref(), Some("persisted"));
    }

    #[test]
    fn empty_chain_has_no_token() {
        assert_eq!(CredentialChain::new().bearer_token(), None);
    }

    #[test]
    fn present_null_is_distinct_from_missing() {
        let v = serde_json::json!({ "nilai": null, "score": "88.5", "bad": "n/a" });
        assert_eq!(first_present(&v, &["value", "nilai"]), Some(&serde_json::Value::Null));
        assert_eq!(first_present(&v, &["value"]), None);
        assert_eq!(field_f64(&v, &["nilai", "score"]), Some(88.5));
        assert_eq!(number_of(&v["bad"]), None);
    }

    #[test]
    fn token_file_is_trimmed_and_missing_file_is_none() {
        let dir = std::env::temp_dir().join(format!("rapord-token-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create dir");
        let p = dir.join("token");
        std::fs::write(&p, "abc123\n").expect("write token");
        assert_eq!(TokenFile::new(&p).bearer_token().as_deref(), Some("abc123"));
        assert_eq!(TokenFile::new(dir.join("nope")).bearer_token(), None);
    }

    #[test]
    fn unwrap_list_accepts_bare_and_wrapped_arrays() {
        assert_eq!(unwrap_list(json!([1, 2])).expect("bare").len(), 2);
        assert_eq!(unwrap_list(json!({ "data": [1] })).expect("wrapped").len(), 1);
        assert!(unwrap_list(json!({ "items": [] })).is_err());
        assert!(unwrap_list(json!("x")).is_err());
    }

    #[test]
    fn field_helpers_accept_alternate_keys() {
        let v = json!({ "_id": 42, "nama": " Budi ", "nilai": "88.5" });
        assert_eq!(field_str(&v, &["id", "_id"]).as_deref(), Some("42"));
        assert_eq!(field_str(&v, &["name", "nama"]).as_deref(), Some("Budi"));
        assert_eq!(field_f64(&v, &["value", "nilai"]), Some(88.5));
        assert_eq!(field_f64(&v, &["weight"]), None);
    }

    #[test]
    fn blank_base_url_is_not_configured() {
        let e = ApiClient::new("  ", None, Box::new(StaticToken::new(None)))
            .err()
            .expect("must fail");
        assert_eq!(e.code(), "remote_not_configured");
    }

    #[test]
    fn url_join_normalizes_slashes() {
        let c = ApiClient::new("http://127.0.0.1:9/api/", None, Box::new(StaticToken::new(None)))
            .expect("client");
        assert_eq!(c.url_for("/classes"), "http://127.0.0.1:9/api/classes");
    }
}
