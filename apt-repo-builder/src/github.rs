// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! GitHub REST API plumbing shared by the release source and destination. */

use {
    crate::{
        error::{RemoteError, RemoteErrorKind},
        io::is_sha256_hex,
    },
    futures::StreamExt,
    reqwest::{
        header::{HeaderMap, ACCEPT, AUTHORIZATION, USER_AGENT},
        Method, RequestBuilder, StatusCode,
    },
    serde::Deserialize,
    std::time::Duration,
};

/// Default GitHub REST API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Media type of REST API responses.
pub const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";

/// Limit on API requests, including the response body.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Limit on the wait for each chunk of a download body.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// A release as returned by the releases API.
#[derive(Debug, Deserialize)]
pub struct GithubRelease {
    #[serde(default)]
    pub id: u64,
    pub tag_name: String,
    /// URL template like `https://uploads.github.com/.../assets{?name,label}`.
    #[serde(default)]
    pub upload_url: String,
    #[serde(default)]
    pub assets: Vec<GithubAsset>,
}

impl GithubRelease {
    /// `upload_url` without its URI template suffix.
    pub fn upload_base(&self) -> &str {
        self.upload_url
            .split_once('{')
            .map(|(base, _)| base)
            .unwrap_or(&self.upload_url)
    }
}

/// A release asset as returned by the releases API.
#[derive(Debug, Deserialize)]
pub struct GithubAsset {
    #[serde(default)]
    pub id: u64,
    pub name: String,
    /// API URL of the asset. Supports authenticated downloads.
    pub url: String,
    pub size: u64,
    /// Content digest like `sha256:<hex>`, when GitHub computed one.
    #[serde(default)]
    pub digest: Option<String>,
}

impl GithubAsset {
    /// Lowercase hex SHA-256 from `digest`, when it is well formed.
    pub fn sha256(&self) -> Option<String> {
        self.digest
            .as_deref()
            .and_then(|d| d.strip_prefix("sha256:"))
            .map(|d| d.to_ascii_lowercase())
            .filter(|d| is_sha256_hex(d))
    }
}

/// Classify an unsuccessful HTTP response.
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> RemoteErrorKind {
    let rate_limit_exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false);

    match status {
        StatusCode::NOT_FOUND => RemoteErrorKind::NotFound,
        StatusCode::TOO_MANY_REQUESTS => RemoteErrorKind::RateLimited,
        StatusCode::FORBIDDEN if rate_limit_exhausted => RemoteErrorKind::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteErrorKind::Unauthorized,
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE => {
            RemoteErrorKind::QuotaExceeded
        }
        s if s.is_server_error() => RemoteErrorKind::NetworkFailure,
        StatusCode::REQUEST_TIMEOUT => RemoteErrorKind::NetworkFailure,
        _ => RemoteErrorKind::NotFound,
    }
}

pub(crate) fn transport_error(e: reqwest::Error) -> RemoteError {
    RemoteError::network(e)
}

/// Pass successful responses through and classify the others.
pub fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();

    if status.is_success() {
        Ok(response)
    } else {
        let kind = classify_status(status, response.headers());
        Err(RemoteError::new(kind, format!("{}: HTTP {}", what, status)))
    }
}

/// The next chunk of a response body, failing if none arrives within `timeout`.
pub(crate) async fn next_chunk<S, E>(
    stream: &mut S,
    timeout: Duration,
    what: &str,
) -> Result<Option<bytes::Bytes>, RemoteError>
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    match tokio::time::timeout(timeout, stream.next()).await {
        Ok(Some(chunk)) => chunk.map(Some).map_err(RemoteError::network),
        Ok(None) => Ok(None),
        Err(_) => Err(RemoteError::network(format!(
            "{}: no data received for {}s",
            what,
            timeout.as_secs()
        ))),
    }
}

/// An authenticated REST API client.
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient")
            .field("api_url", &self.api_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl GitHubClient {
    pub fn new(api_url: Option<&str>, token: Option<String>) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(transport_error)?;

        Ok(Self {
            client,
            api_url: api_url
                .unwrap_or(DEFAULT_API_URL)
                .trim_end_matches('/')
                .to_string(),
            token,
        })
    }

    /// Absolute URL of an API path like `/repos/o/r/releases`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    /// A request carrying the user agent and credentials.
    pub fn request(&self, method: Method, url: &str, accept: &str) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, url)
            .header(ACCEPT, accept)
            .header(USER_AGENT, concat!("apt-repo-builder/", env!("CARGO_PKG_VERSION")));

        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        request
    }

    /// Send a request, turning unsuccessful statuses into errors.
    pub async fn send(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response, RemoteError> {
        let response = request.send().await.map_err(transport_error)?;

        check_status(response, what)
    }

    /// Send a request and decode its JSON response.
    pub async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T, RemoteError> {
        self.send(request.timeout(REQUEST_TIMEOUT), what)
            .await?
            .json::<T>()
            .await
            .map_err(transport_error)
    }
}
