use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use github_release_feed::config::Config;
use github_release_feed::feed::FeedBuilder;
use github_release_feed::fetcher::ReleaseFetcher;
use github_release_feed::refresh::{start_background_refresh, Refresher};
use github_release_feed::routes::{self, AppState};
use github_release_feed::store::ConfigStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "github_release_feed=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path =
        std::env::var("RELEASE_FEED_CONFIG").unwrap_or_else(|_| "release-feed.toml".to_string());
    let config = Config::load_or_default(&config_path)?;
    info!("Using data directory {}", config.data_dir.display());

    let store = Arc::new(
        ConfigStore::new(&config.data_dir)
            .with_fallback_token(std::env::var("GITHUB_TOKEN").ok()),
    );
    let startup_refresh = match store.load() {
        Ok(snapshot) => {
            info!(
                "Monitoring {} repositories, refresh every {}s, max {} entries, token {}",
                snapshot.repos.len(),
                snapshot.settings.poll_interval_secs,
                snapshot.settings.max_entries,
                if snapshot.token.is_some() { "present" } else { "absent" }
            );
            snapshot.settings.startup_refresh
        }
        Err(e) => {
            warn!("Configuration could not be loaded yet: {}", e);
            true
        }
    };
    let startup_refresh = startup_refresh
        && std::env::var("STARTUP_REFRESH")
            .map(|v| !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true);

    let fetcher = ReleaseFetcher::new(&config.api_base_url, &config.user_agent)?;
    let builder = FeedBuilder::new(config.feed.clone());
    let refresher = Arc::new(Refresher::new(store.clone(), fetcher, builder)?);

    // Start background refresh task
    let bg_refresher = refresher.clone();
    tokio::spawn(async move {
        start_background_refresh(bg_refresher, startup_refresh).await;
    });

    let state = Arc::new(AppState { store, refresher });
    let app = routes::router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    info!("Server starting on http://{}", config.bind);

    axum::serve(listener, app).await?;

    Ok(())
}
