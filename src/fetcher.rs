use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{RepoRef, Settings};

const GITHUB_API_VERSION: &str = "2022-11-28";

/// Largest page the releases endpoint serves.
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited by GitHub (status {status})")]
    RateLimited {
        status: u16,
        /// Unix timestamp from `x-ratelimit-reset`, when GitHub sent one
        reset_at: Option<i64>,
    },

    #[error("request failed: {0}")]
    FetchFailed(#[source] reqwest::Error),

    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("failed to decode releases: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// A release as returned by `GET /repos/{owner}/{repo}/releases`.
#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    name: Option<String>,
    html_url: String,
    body: Option<String>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    author: Option<GithubUser>,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    login: String,
}

/// One release, normalized for the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseRecord {
    pub repo: RepoRef,
    pub title: String,
    pub tag: String,
    pub url: String,
    pub body: String,
    pub published_at: DateTime<Utc>,
    pub author: Option<String>,
    pub prerelease: bool,
}

impl ReleaseRecord {
    fn from_github(repo: &RepoRef, release: GithubRelease) -> Self {
        let title = release
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| release.tag_name.clone());

        Self {
            repo: repo.clone(),
            title,
            tag: release.tag_name,
            url: release.html_url,
            body: release.body.unwrap_or_default(),
            published_at: release.published_at.unwrap_or(release.created_at),
            author: release.author.map(|a| a.login),
            prerelease: release.prerelease,
        }
    }
}

/// Per-cycle knobs taken from [`Settings`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub releases_per_repo: usize,
    pub include_prereleases: bool,
    pub timeout: Duration,
    pub max_concurrent: usize,
}

impl From<&Settings> for FetchOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            releases_per_repo: settings.releases_per_repo,
            include_prereleases: settings.include_prereleases,
            timeout: Duration::from_secs(settings.request_timeout_secs),
            max_concurrent: settings.max_concurrent_fetches,
        }
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

/// Result of fetching every configured repository once.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub records: Vec<ReleaseRecord>,
    pub succeeded: usize,
    pub failures: Vec<(RepoRef, FetchError)>,
}

pub struct ReleaseFetcher {
    client: Client,
    api_base: String,
}

impl ReleaseFetcher {
    pub fn new(api_base: &str, user_agent: &str) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    pub async fn fetch_releases(
        &self,
        repo: &RepoRef,
        token: Option<&str>,
        options: &FetchOptions,
    ) -> Result<Vec<ReleaseRecord>, FetchError> {
        let url = format!(
            "{}/repos/{}/{}/releases",
            self.api_base,
            repo.owner(),
            repo.name()
        );
        debug!("Fetching releases for {}", repo);

        // Drafts (visible with a token) and skipped prereleases are removed
        // after the page arrives, so ask for a full page when either applies
        let filtering = !options.include_prereleases || token.is_some();
        let per_page = if filtering {
            MAX_PAGE_SIZE
        } else {
            options.releases_per_repo.clamp(1, MAX_PAGE_SIZE)
        }
        .to_string();
        let mut request = self
            .client
            .get(&url)
            .query(&[("per_page", per_page.as_str())])
            .header(header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .timeout(options.timeout);

        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(FetchError::FetchFailed)?;
        let status = response.status();

        match status {
            StatusCode::NOT_FOUND => {
                info!("Repository {} has no releases or does not exist", repo);
                return Ok(Vec::new());
            }
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                let reset_at = response
                    .headers()
                    .get("x-ratelimit-reset")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                return Err(FetchError::RateLimited {
                    status: status.as_u16(),
                    reset_at,
                });
            }
            s if !s.is_success() => return Err(FetchError::UnexpectedStatus(s.as_u16())),
            _ => {}
        }

        let releases: Vec<GithubRelease> = response.json().await.map_err(FetchError::Decode)?;

        let records: Vec<ReleaseRecord> = releases
            .into_iter()
            .filter(|r| !r.draft)
            .filter(|r| options.include_prereleases || !r.prerelease)
            .take(options.releases_per_repo)
            .map(|r| ReleaseRecord::from_github(repo, r))
            .collect();

        debug!("Got {} releases for {}", records.len(), repo);
        Ok(records)
    }

    /// Fetch every repository concurrently. Failures are collected per
    /// repository and never affect the others.
    pub async fn fetch_all(
        &self,
        repos: &[RepoRef],
        token: Option<&str>,
        options: &FetchOptions,
    ) -> FetchReport {
        let started = Instant::now();
        info!("Fetching releases for {} repositories", repos.len());

        let tasks: Vec<_> = repos
            .iter()
            .map(|repo| {
                async move {
                    let result = self.fetch_releases(repo, token, options).await;
                    (repo, result)
                }
                .boxed()
            })
            .collect();

        let results: Vec<_> = stream::iter(tasks)
            .buffer_unordered(options.max_concurrent.max(1))
            .collect()
            .await;

        let mut report = FetchReport::default();
        for (repo, result) in results {
            match result {
                Ok(records) => {
                    report.succeeded += 1;
                    report.records.extend(records);
                }
                Err(e @ FetchError::RateLimited { .. }) => {
                    warn!("Skipping {} this cycle: {}", repo, e);
                    report.failures.push((repo.clone(), e));
                }
                Err(e) => {
                    warn!("Failed to fetch releases for {}: {}", repo, e);
                    report.failures.push((repo.clone(), e));
                }
            }
        }

        info!(
            "Fetched {} releases from {}/{} repositories in {:.2?}",
            report.records.len(),
            report.succeeded,
            repos.len(),
            started.elapsed()
        );
        report
    }
}
