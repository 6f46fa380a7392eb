use std::str::FromStr;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Form, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::refresh::{RefreshSummary, Refresher};
use crate::store::{parse_repo_list_strict, ConfigError, ConfigStore, Settings};

const MAX_LIMIT: usize = 500;

pub struct AppState {
    pub store: Arc<ConfigStore>,
    pub refresher: Arc<Refresher>,
}

#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {
    pub settings: Settings,
    pub repos_text: String,
    pub repo_count: usize,
    pub has_token: bool,
    pub refreshing: bool,
    pub auto_refresh: bool,
    pub last_refresh: Option<RefreshSummary>,
    pub item_count: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/rss", get(rss_feed))
        .route("/settings", post(save_settings))
        .route("/repos", post(save_repos))
        .route("/token", post(save_token))
        .route("/refresh", post(refresh))
        .route("/auto-refresh/stop", post(stop_auto_refresh))
        .route("/auto-refresh/start", post(start_auto_refresh))
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Wrapper for HTML responses
struct HtmlTemplate<T>(T);

impl<T: Template> IntoResponse for HtmlTemplate<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to render template: {}", err),
            )
                .into_response(),
        }
    }
}

// Custom error type
pub enum AppError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Internal(err) => {
                error!("Request failed: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Invalid(_) | ConfigError::InvalidRepo { .. } => {
                AppError::BadRequest(err.to_string())
            }
            other => AppError::Internal(other.into()),
        }
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(err.into())
    }
}

impl From<crate::feed::BuildError> for AppError {
    fn from(err: crate::feed::BuildError) -> Self {
        AppError::Internal(err.into())
    }
}

fn message(text: impl Into<String>) -> Json<serde_json::Value> {
    Json(json!({ "message": text.into() }))
}

/// Run file-backed store work off the async worker threads.
async fn with_store<T, F>(state: &AppState, f: F) -> Result<T, AppError>
where
    F: FnOnce(&ConfigStore) -> Result<T, ConfigError> + Send + 'static,
    T: Send + 'static,
{
    let store = state.store.clone();
    Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
}

fn parse_field<T: FromStr>(name: &str, value: &str) -> Result<T, AppError> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::BadRequest(format!("{name} must be a whole number")))
}

/// Run a refresh in the background; overlapping triggers collapse into the
/// refresh already in flight.
fn trigger_refresh(state: &AppState) {
    let refresher = state.refresher.clone();
    tokio::spawn(async move {
        refresher.refresh().await;
    });
}

// Route handlers
pub async fn index(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let (settings, repos_text, repo_count, has_token) = with_store(&state, |store| {
        Ok((
            store.load_settings().unwrap_or_default(),
            store.load_repos_text().unwrap_or_default(),
            store.load_repos().map(|r| r.len()).unwrap_or(0),
            store.has_token(),
        ))
    })
    .await?;
    let cached = state.refresher.cache().current().await;

    Ok(HtmlTemplate(IndexTemplate {
        settings,
        repos_text,
        repo_count,
        has_token,
        refreshing: state.refresher.is_refreshing(),
        auto_refresh: state.refresher.auto_refresh_enabled(),
        last_refresh: state.refresher.last_summary().await,
        item_count: cached.records.len(),
    }))
}

#[derive(Deserialize)]
pub struct RssQuery {
    pub limit: Option<usize>,
}

pub async fn rss_feed(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RssQuery>,
) -> Result<impl IntoResponse, AppError> {
    let cached = state.refresher.cache().current().await;
    let settings = state.refresher.current_settings().await;

    let body = match query.limit.map(|l| l.min(MAX_LIMIT)) {
        Some(limit) if limit < cached.records.len() => state.refresher.render_limited(limit).await?,
        _ => cached.xml.clone(),
    };

    Ok((
        [
            (header::CONTENT_TYPE, "application/rss+xml; charset=utf-8".to_string()),
            (
                header::CACHE_CONTROL,
                format!("public, max-age={}", settings.poll_interval_secs),
            ),
        ],
        body,
    ))
}

// Numbers arrive as text so bad input is reported as a JSON 400
#[derive(Deserialize)]
pub struct SettingsForm {
    #[serde(default)]
    pub poll_interval_secs: String,
    #[serde(default)]
    pub max_entries: String,
    #[serde(default)]
    pub releases_per_repo: Option<String>,
    // Checkboxes are only submitted when ticked
    #[serde(default)]
    pub include_prereleases: Option<String>,
    #[serde(default)]
    pub startup_refresh: Option<String>,
}

pub async fn save_settings(
    State(state): State<Arc<AppState>>,
    Form(form): Form<SettingsForm>,
) -> Result<impl IntoResponse, AppError> {
    let poll_interval_secs = parse_field("poll_interval_secs", &form.poll_interval_secs)?;
    let max_entries = parse_field("max_entries", &form.max_entries)?;
    let releases_per_repo = match form.releases_per_repo.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Some(parse_field("releases_per_repo", value)?),
        _ => None,
    };

    let current = with_store(&state, |store| Ok(store.load_settings().unwrap_or_default())).await?;
    let settings = Settings {
        poll_interval_secs,
        max_entries,
        releases_per_repo: releases_per_repo.unwrap_or(current.releases_per_repo),
        include_prereleases: form.include_prereleases.is_some(),
        startup_refresh: form.startup_refresh.is_some(),
        ..current
    };

    let saved = settings.clone();
    with_store(&state, move |store| store.save_settings(&saved)).await?;
    state.refresher.reschedule();
    trigger_refresh(&state);

    Ok(Json(json!({
        "message": "Settings saved",
        "poll_interval_secs": settings.poll_interval_secs,
        "max_entries": settings.max_entries,
    })))
}

#[derive(Deserialize)]
pub struct ReposForm {
    #[serde(default)]
    pub repos: String,
}

pub async fn save_repos(
    State(state): State<Arc<AppState>>,
    Form(form): Form<ReposForm>,
) -> Result<impl IntoResponse, AppError> {
    let repos = parse_repo_list_strict(&form.repos)?;
    let count = repos.len();
    with_store(&state, move |store| store.save_repos(&repos)).await?;
    trigger_refresh(&state);

    Ok(message(format!("Saved {} repositories", count)))
}

#[derive(Deserialize)]
pub struct TokenForm {
    #[serde(default)]
    pub token: String,
}

pub async fn save_token(
    State(state): State<Arc<AppState>>,
    Form(form): Form<TokenForm>,
) -> Result<impl IntoResponse, AppError> {
    let cleared = form.token.trim().is_empty();
    with_store(&state, move |store| store.save_token(&form.token)).await?;
    trigger_refresh(&state);

    if cleared {
        Ok(message("GitHub token cleared"))
    } else {
        Ok(message("GitHub token saved"))
    }
}

pub async fn refresh(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("Manual refresh requested");
    trigger_refresh(&state);
    (StatusCode::ACCEPTED, message("Refresh started"))
}

pub async fn stop_auto_refresh(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.refresher.pause_auto_refresh();
    message("Automatic refresh stopped")
}

pub async fn start_auto_refresh(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.refresher.resume_auto_refresh();
    let settings = state.refresher.current_settings().await;
    message(format!(
        "Automatic refresh started, every {} seconds",
        settings.poll_interval_secs
    ))
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub repos_count: usize,
    pub has_github_token: bool,
    /// `None` until a refresh has published a feed.
    pub cache_age_seconds: Option<i64>,
    pub cached_items: usize,
    pub refreshing: bool,
    pub auto_refresh: bool,
    pub refresh_count: u64,
    pub poll_interval_secs: u64,
    pub max_entries: usize,
    pub last_refresh: Option<RefreshSummary>,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, AppError> {
    let (repos_count, has_github_token) = with_store(&state, |store| {
        Ok((store.load_repos().map(|r| r.len()).unwrap_or(0), store.has_token()))
    })
    .await?;
    let cached = state.refresher.cache().current().await;
    let settings = state.refresher.current_settings().await;
    let last_refresh = state.refresher.last_summary().await;

    Ok(Json(StatusResponse {
        repos_count,
        has_github_token,
        cache_age_seconds: last_refresh
            .as_ref()
            .map(|_| (Utc::now() - cached.generated_at).num_seconds()),
        cached_items: cached.records.len(),
        refreshing: state.refresher.is_refreshing(),
        auto_refresh: state.refresher.auto_refresh_enabled(),
        refresh_count: state.refresher.passes_run(),
        poll_interval_secs: settings.poll_interval_secs,
        max_entries: settings.max_entries,
        last_refresh,
    }))
}

pub async fn health() -> impl IntoResponse {
    Html("OK")
}
