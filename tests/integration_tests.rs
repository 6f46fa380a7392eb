//! Integration tests for the github-release-feed service
//!
//! These tests drive the whole pipeline: the config store on disk, the
//! release fetcher against a mocked GitHub API, the feed builder and the
//! HTTP routes.

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common {
    use super::*;
    use axum_test::TestServer;
    use github_release_feed::config::ChannelConfig;
    use github_release_feed::feed::FeedBuilder;
    use github_release_feed::fetcher::ReleaseFetcher;
    use github_release_feed::refresh::Refresher;
    use github_release_feed::routes::{router, AppState};
    use github_release_feed::store::ConfigStore;
    use tempfile::TempDir;

    pub struct TestApp {
        pub server: TestServer,
        pub state: Arc<AppState>,
        pub _dir: TempDir,
    }

    /// Build the full application against a mocked GitHub API
    pub fn create_app(github: &MockServer) -> TestApp {
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        let store = Arc::new(ConfigStore::new(dir.path()));
        let fetcher = ReleaseFetcher::new(&github.uri(), "integration-tests").unwrap();
        let refresher = Arc::new(
            Refresher::new(store.clone(), fetcher, FeedBuilder::new(ChannelConfig::default()))
                .unwrap(),
        );
        let state = Arc::new(AppState { store, refresher });
        let server = TestServer::new(router(state.clone())).unwrap();

        TestApp {
            server,
            state,
            _dir: dir,
        }
    }

    pub async fn mock_releases(github: &MockServer, repo: &str, releases: &[(&str, &str)]) {
        let body: Vec<_> = releases
            .iter()
            .map(|(tag, published)| {
                json!({
                    "tag_name": tag,
                    "name": format!("{tag} release"),
                    "html_url": format!("https://github.com/{repo}/releases/tag/{tag}"),
                    "body": format!("Changes in {tag}"),
                    "draft": false,
                    "prerelease": false,
                    "created_at": published,
                    "published_at": published,
                    "author": { "login": "maintainer" }
                })
            })
            .collect();

        Mock::given(method("GET"))
            .and(path(format!("/repos/{repo}/releases")))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(github)
            .await;
    }

    pub fn item_titles(xml: &str) -> Vec<String> {
        let feed = feed_rs::parser::parse(xml.as_bytes()).expect("feed should parse");
        feed.entries
            .into_iter()
            .filter_map(|e| e.title.map(|t| t.content))
            .collect()
    }
}

#[cfg(test)]
mod feed_scenario_tests {
    use super::common::*;
    use super::*;

    #[tokio::test]
    async fn test_newest_release_first() {
        let github = MockServer::start().await;
        mock_releases(&github, "a/x", &[("v1", "2024-01-02T00:00:00Z")]).await;
        mock_releases(&github, "b/y", &[("v1", "2024-01-03T00:00:00Z")]).await;
        let app = create_app(&github);

        app.server
            .post("/repos")
            .form(&[("repos", "a/x\nb/y\n")])
            .await
            .assert_status_ok();
        app.state.refresher.refresh().await;

        let response = app.server.get("/rss").await;
        response.assert_status_ok();

        let titles = item_titles(&response.text());
        assert_eq!(titles, vec!["b/y: v1 release", "a/x: v1 release"]);
    }

    #[tokio::test]
    async fn test_max_entries_one_keeps_most_recent() {
        let github = MockServer::start().await;
        mock_releases(&github, "a/x", &[("v1", "2024-01-02T00:00:00Z")]).await;
        mock_releases(&github, "b/y", &[("v1", "2024-01-03T00:00:00Z")]).await;
        let app = create_app(&github);

        app.server
            .post("/repos")
            .form(&[("repos", "a/x\nb/y")])
            .await
            .assert_status_ok();
        app.server
            .post("/settings")
            .form(&[("poll_interval_secs", "600"), ("max_entries", "1")])
            .await
            .assert_status_ok();
        app.state.refresher.refresh().await;

        let titles = item_titles(&app.server.get("/rss").await.text());
        assert_eq!(titles, vec!["b/y: v1 release"]);
    }

    #[tokio::test]
    async fn test_missing_and_failing_repos_do_not_block_others() {
        let github = MockServer::start().await;
        mock_releases(
            &github,
            "a/x",
            &[("v2", "2024-03-01T00:00:00Z"), ("v1", "2024-02-01T00:00:00Z")],
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/repos/gone/away/releases"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&github)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/slow/down/releases"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&github)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/broken/api/releases"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&github)
            .await;
        let app = create_app(&github);

        app.server
            .post("/repos")
            .form(&[("repos", "gone/away\nslow/down\na/x\nbroken/api")])
            .await
            .assert_status_ok();
        app.server
            .post("/settings")
            .form(&[
                ("poll_interval_secs", "600"),
                ("max_entries", "100"),
                ("releases_per_repo", "5"),
            ])
            .await
            .assert_status_ok();
        app.state.refresher.refresh().await;

        let titles = item_titles(&app.server.get("/rss").await.text());
        assert_eq!(titles, vec!["a/x: v2 release", "a/x: v1 release"]);

        let status: serde_json::Value = app.server.get("/status").await.json();
        assert_eq!(status["last_refresh"]["repos_total"], 4);
        assert_eq!(status["last_refresh"]["repos_succeeded"], 2);
        assert_eq!(status["last_refresh"]["skipped"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_token_is_sent_after_saving() {
        let github = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/a/x/releases"))
            .and(header("authorization", "Bearer ghp_integration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "tag_name": "v9",
                "html_url": "https://github.com/a/x/releases/tag/v9",
                "created_at": "2024-05-05T00:00:00Z",
                "published_at": "2024-05-05T00:00:00Z"
            }])))
            .mount(&github)
            .await;
        let app = create_app(&github);

        app.server
            .post("/token")
            .form(&[("token", "ghp_integration")])
            .await
            .assert_status_ok();
        app.server
            .post("/repos")
            .form(&[("repos", "a/x")])
            .await
            .assert_status_ok();
        app.state.refresher.refresh().await;

        let titles = item_titles(&app.server.get("/rss").await.text());
        assert_eq!(titles, vec!["a/x: v9"]);
    }

    #[tokio::test]
    async fn test_empty_repo_list_serves_empty_feed() {
        let github = MockServer::start().await;
        let app = create_app(&github);

        app.state.refresher.refresh().await;

        let response = app.server.get("/rss").await;
        response.assert_status_ok();
        assert!(item_titles(&response.text()).is_empty());
    }
}

#[cfg(test)]
mod config_integration_tests {
    use github_release_feed::config::Config;
    use github_release_feed::store::{ConfigStore, Settings};

    #[test]
    fn test_load_shipped_config() {
        let config = Config::load("release-feed.toml");
        assert!(config.is_ok(), "Failed to load release-feed.toml: {:?}", config.err());

        let config = config.unwrap();
        assert_eq!(config.api_base_url, "https://api.github.com");
        assert!(config.feed.link.ends_with("/rss"));
    }

    #[test]
    fn test_settings_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = ConfigStore::new(dir.path());
            store.load().unwrap();
            store
                .save_settings(&Settings {
                    poll_interval_secs: 3600,
                    max_entries: 7,
                    ..Settings::default()
                })
                .unwrap();
        }

        // A fresh store over the same directory sees the saved values
        let store = ConfigStore::new(dir.path());
        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.settings.poll_interval_secs, 3600);
        assert_eq!(snapshot.settings.max_entries, 7);
    }

    #[test]
    fn test_hand_edited_repo_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("repos.txt"),
            "# my repos\nrust-lang/rust\n\ninvalid line\ntokio-rs/axum\n",
        )
        .unwrap();

        let snapshot = ConfigStore::new(dir.path()).load().unwrap();
        let repos: Vec<_> = snapshot.repos.iter().map(|r| r.to_string()).collect();
        assert_eq!(repos, vec!["rust-lang/rust", "tokio-rs/axum"]);
    }
}
