//! Client for the app authorization service.
//!
//! Confirms that the holder of a bearer token may open SSH sessions to a
//! given application, and maps the app id to its current process guid.

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Successful authorization response: the app's current process guid.
#[derive(Debug, Clone, Deserialize)]
pub struct AppSshResponse {
    pub process_guid: String,
}

#[derive(Debug, Error)]
pub enum AppAccessError {
    #[error("ssh access forbidden")]
    Forbidden,
    #[error("app not found")]
    NotFound,
    #[error("app authorization service unreachable: {0}")]
    Unreachable(String),
    #[error("malformed app authorization response")]
    Malformed,
}

/// HTTP client for `GET /internal/apps/<guid>/ssh_access`.
pub struct AppSshAccessClient {
    base_url: String,
    client: reqwest::Client,
}

impl AppSshAccessClient {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Check SSH access for an app. `auth_header` is passed through verbatim
    /// as the `Authorization` header.
    pub async fn check_ssh_access(
        &self,
        app_guid: &str,
        auth_header: &str,
    ) -> Result<AppSshResponse, AppAccessError> {
        let url = format!("{}/internal/apps/{}/ssh_access", self.base_url, app_guid);
        debug!(%url, "checking ssh access");

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, auth_header)
            .send()
            .await
            .map_err(|e| AppAccessError::Unreachable(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::OK => response
                .json()
                .await
                .map_err(|_| AppAccessError::Malformed),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(AppAccessError::Forbidden)
            }
            reqwest::StatusCode::NOT_FOUND => Err(AppAccessError::NotFound),
            status => Err(AppAccessError::Unreachable(format!(
                "unexpected status {status}"
            ))),
        }
    }
}
