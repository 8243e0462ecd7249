use crate::altered::config::{API_ROOT, WEB_ROOT};
use crate::http::build_client;
use reqwest::{Client, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlteredError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// Thin client over the platform's REST API.
#[derive(Debug, Clone)]
pub struct AlteredClient {
    api_root: String,
    web_root: String,
    pub(crate) http: Client,
}

impl AlteredClient {
    pub fn new(api_root: impl Into<String>, web_root: impl Into<String>) -> Self {
        let api_root = api_root.into().trim_end_matches('/').to_string();
        let web_root = web_root.into().trim_end_matches('/').to_string();
        Self {
            http: build_client(&format!("{web_root}/")),
            api_root,
            web_root,
        }
    }

    pub fn from_env() -> Self {
        Self::new(API_ROOT.as_str(), WEB_ROOT.as_str())
    }

    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.api_root, path.trim_start_matches('/'))
    }

    pub(crate) fn web_url(&self, path: &str) -> String {
        format!("{}/{}", self.web_root, path.trim_start_matches('/'))
    }
}

/// Turns a non-2xx response into [`AlteredError::Status`], keeping the body.
pub(crate) async fn ensure_success(response: Response) -> Result<Response, AlteredError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AlteredError::Status {
        status: status.as_u16(),
        body,
    })
}
