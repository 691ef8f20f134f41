//! GitHub release host client.
//!
//! Wraps the REST API for release lookups and the raw-content host for
//! source-tree files. Base URLs are injectable so tests can point the client
//! at a local mock server.

use reqwest::header::{self, HeaderMap};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use crate::error::{Error, Result};

pub const API_BASE: &str = "https://api.github.com";
pub const RAW_BASE: &str = "https://raw.githubusercontent.com";

/// Build the shared HTTP client.
pub fn build_client() -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::USER_AGENT,
        header::HeaderValue::from_static(crate::USER_AGENT),
    );
    Ok(Client::builder().default_headers(headers).build()?)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: Option<u64>,
    /// `sha256:<hex>` when the host computed one.
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone)]
pub struct ReleaseHost {
    client: Client,
    api_base: String,
    raw_base: String,
    token: Option<String>,
}

impl ReleaseHost {
    pub fn new(client: Client, token: Option<String>) -> Self {
        Self {
            client,
            api_base: API_BASE.to_string(),
            raw_base: RAW_BASE.to_string(),
            token,
        }
    }

    pub fn with_base_urls(mut self, api_base: impl Into<String>, raw_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self.raw_base = raw_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// GET with the bearer token attached when one is configured.
    pub fn get(&self, url: &str) -> RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn api_get(&self, path: &str) -> RequestBuilder {
        self.get(&format!("{}{path}", self.api_base))
            .header(header::ACCEPT, "application/vnd.github+json")
    }

    /// The release marked latest, falling back to the newest listed release
    /// when none is marked.
    pub async fn latest_release(&self, owner: &str, repo: &str) -> Result<Release> {
        let what = format!("latest release of {owner}/{repo}");
        let resp = self
            .api_get(&format!("/repos/{owner}/{repo}/releases/latest"))
            .send()
            .await?;

        if resp.status() != StatusCode::NOT_FOUND {
            let resp = check_status(resp, &what, self.has_token())?;
            return Ok(resp.json().await?);
        }

        tracing::debug!(owner, repo, "no release marked latest, listing releases");
        let resp = self
            .api_get(&format!("/repos/{owner}/{repo}/releases?per_page=10"))
            .send()
            .await?;
        let resp = check_status(resp, &format!("releases of {owner}/{repo}"), self.has_token())?;
        let releases: Vec<Release> = resp.json().await?;
        releases
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("no releases published for {owner}/{repo}")))
    }

    pub async fn release_by_tag(&self, owner: &str, repo: &str, tag: &str) -> Result<Release> {
        let resp = self
            .api_get(&format!("/repos/{owner}/{repo}/releases/tags/{tag}"))
            .send()
            .await?;
        let resp = check_status(
            resp,
            &format!("release {tag} of {owner}/{repo}"),
            self.has_token(),
        )?;
        Ok(resp.json().await?)
    }

    /// List a source-tree directory at `tag`.
    pub async fn list_directory(
        &self,
        owner: &str,
        repo: &str,
        tag: &str,
        dir: &str,
    ) -> Result<Vec<ContentEntry>> {
        let dir = dir.trim_matches('/');
        let resp = self
            .api_get(&format!("/repos/{owner}/{repo}/contents/{dir}"))
            .query(&[("ref", tag)])
            .send()
            .await?;
        let resp = check_status(
            resp,
            &format!("directory '{dir}' of {owner}/{repo}@{tag}"),
            self.has_token(),
        )?;
        Ok(resp.json().await?)
    }

    /// Raw-content URL of a source-tree file at `tag`.
    pub fn raw_url(&self, owner: &str, repo: &str, tag: &str, path: &str) -> String {
        format!(
            "{}/{owner}/{repo}/{tag}/{}",
            self.raw_base,
            path.trim_start_matches('/')
        )
    }
}

/// Map host responses onto engine errors.
///
/// A 403 without a token is the host's anonymous rate limit, so it is
/// reported as `RateLimited` rather than a generic failure.
pub fn check_status(resp: Response, what: &str, authenticated: bool) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let exhausted = resp
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0");
    let auth = if authenticated {
        "using auth"
    } else {
        "without auth"
    };

    Err(match status {
        StatusCode::NOT_FOUND => Error::NotFound(what.to_string()),
        StatusCode::TOO_MANY_REQUESTS => {
            Error::RateLimited(format!("{what}: host throttled request ({auth})"))
        }
        StatusCode::FORBIDDEN if exhausted || !authenticated => Error::RateLimited(format!(
            "{what}: rate limit reached ({auth}); configure a download token to raise it"
        )),
        StatusCode::UNAUTHORIZED => {
            Error::DownloadFailed(format!("{what}: download token rejected"))
        }
        _ => Error::DownloadFailed(format!("{what}: HTTP {status} ({auth})")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn host(server: &Server, token: Option<&str>) -> ReleaseHost {
        ReleaseHost::new(Client::new(), token.map(str::to_string))
            .with_base_urls(server.url(), server.url())
    }

    #[tokio::test]
    async fn test_latest_release_falls_back_to_list() {
        let mut server = Server::new_async().await;
        let _latest = server
            .mock("GET", "/repos/PenumbraOS/pinitd/releases/latest")
            .with_status(404)
            .create_async()
            .await;
        let _list = server
            .mock("GET", "/repos/PenumbraOS/pinitd/releases")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"[{"tag_name":"v0.3.0","assets":[]},{"tag_name":"v0.2.0","assets":[]}]"#)
            .create_async()
            .await;

        let release = host(&server, None)
            .latest_release("PenumbraOS", "pinitd")
            .await
            .unwrap();
        assert_eq!(release.tag_name, "v0.3.0");
    }

    #[tokio::test]
    async fn test_forbidden_without_token_is_rate_limited() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/repos/PenumbraOS/mabl/releases/latest")
            .with_status(403)
            .create_async()
            .await;

        let err = host(&server, None)
            .latest_release("PenumbraOS", "mabl")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited(ref m) if m.contains("without auth")));
    }

    #[tokio::test]
    async fn test_forbidden_with_token_is_download_failure() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/repos/PenumbraOS/mabl/releases/tags/v1")
            .match_header("authorization", "Bearer ghp_test")
            .with_status(403)
            .create_async()
            .await;

        let err = host(&server, Some("ghp_test"))
            .release_by_tag("PenumbraOS", "mabl", "v1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DownloadFailed(_)));
    }

    #[tokio::test]
    async fn test_exhausted_quota_with_token_is_rate_limited() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/repos/PenumbraOS/sdk/releases/tags/v1")
            .with_status(403)
            .with_header("x-ratelimit-remaining", "0")
            .create_async()
            .await;

        let err = host(&server, Some("ghp_test"))
            .release_by_tag("PenumbraOS", "sdk", "v1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited(_)));
    }

    #[tokio::test]
    async fn test_list_directory_passes_ref() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/repos/PenumbraOS/sdk/contents/config")
            .match_query(Matcher::UrlEncoded("ref".into(), "v1".into()))
            .with_status(200)
            .with_body(r#"[{"name":"a.unit","path":"config/a.unit","type":"file"}]"#)
            .create_async()
            .await;

        let entries = host(&server, None)
            .list_directory("PenumbraOS", "sdk", "v1", "config/")
            .await
            .unwrap();
        assert_eq!(entries[0].path, "config/a.unit");
    }

    #[test]
    fn test_raw_url() {
        let host = ReleaseHost::new(Client::new(), None);
        assert_eq!(
            host.raw_url("PenumbraOS", "sdk", "v1", "/config/a.unit"),
            "https://raw.githubusercontent.com/PenumbraOS/sdk/v1/config/a.unit"
        );
    }
}
