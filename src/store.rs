//! Flat-file persistence for the monitored repositories, the settings
//! document and the GitHub token.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, warn};

pub const REPOS_FILE: &str = "repos.txt";
pub const SETTINGS_FILE: &str = "settings.json";
pub const DEFAULT_TOKEN_FILE: &str = "token.txt";

const REPOS_FILE_HEADER: &str = "\
# One GitHub repository per line, as owner/name.
# Blank lines and lines starting with # are ignored.
";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid settings: {0}")]
    Invalid(String),

    #[error("invalid repository on line {line}: {value:?}")]
    InvalidRepo { line: usize, value: String },
}

/// A GitHub repository identified as `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoRef {
    owner: String,
    name: String,
}

impl RepoRef {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Public releases page, used as the RSS `<source>` of an item.
    pub fn releases_page(&self) -> String {
        format!("https://github.com/{}/{}/releases", self.owner, self.name)
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

impl FromStr for RepoRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (owner, name) = s
            .split_once('/')
            .ok_or_else(|| format!("expected owner/name, got {s:?}"))?;

        if !is_valid_segment(owner) || !is_valid_segment(name) {
            return Err(format!("expected owner/name, got {s:?}"));
        }

        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Parse a repository list, skipping (and logging) lines that are not
/// `owner/name`. Duplicates keep their first position.
pub fn parse_repo_list(text: &str) -> Vec<RepoRef> {
    let mut repos: Vec<RepoRef> = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match line.parse::<RepoRef>() {
            Ok(repo) if !repos.contains(&repo) => repos.push(repo),
            Ok(_) => {}
            Err(_) => warn!("Ignoring invalid repository on line {}: {}", idx + 1, line),
        }
    }

    repos
}

/// Like [`parse_repo_list`], but the first invalid line is an error. Used for
/// input coming from the settings editor.
pub fn parse_repo_list_strict(text: &str) -> Result<Vec<RepoRef>, ConfigError> {
    let mut repos: Vec<RepoRef> = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let repo = line.parse::<RepoRef>().map_err(|_| ConfigError::InvalidRepo {
            line: idx + 1,
            value: line.to_string(),
        })?;
        if !repos.contains(&repo) {
            repos.push(repo);
        }
    }

    Ok(repos)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Seconds between scheduled refreshes
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upper bound on the number of items in the feed
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Token file name, relative to the data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,
    #[serde(default = "default_releases_per_repo")]
    pub releases_per_repo: usize,
    #[serde(default = "default_true")]
    pub include_prereleases: bool,
    #[serde(default = "default_true")]
    pub startup_refresh: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

fn default_poll_interval_secs() -> u64 {
    1800
}

fn default_max_entries() -> usize {
    100
}

fn default_releases_per_repo() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_concurrent_fetches() -> usize {
    20
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_entries: default_max_entries(),
            token_file: None,
            releases_per_repo: default_releases_per_repo(),
            include_prereleases: true,
            startup_refresh: true,
            request_timeout_secs: default_request_timeout_secs(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
        }
    }
}

impl Settings {
    pub const POLL_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 60..=86_400;
    pub const MAX_ENTRIES_RANGE: std::ops::RangeInclusive<usize> = 1..=500;

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !Self::POLL_INTERVAL_RANGE.contains(&self.poll_interval_secs) {
            return Err(ConfigError::Invalid(format!(
                "poll_interval_secs must be between 60 and 86400, got {}",
                self.poll_interval_secs
            )));
        }
        if !Self::MAX_ENTRIES_RANGE.contains(&self.max_entries) {
            return Err(ConfigError::Invalid(format!(
                "max_entries must be between 1 and 500, got {}",
                self.max_entries
            )));
        }
        if !(1..=100).contains(&self.releases_per_repo) {
            return Err(ConfigError::Invalid(format!(
                "releases_per_repo must be between 1 and 100, got {}",
                self.releases_per_repo
            )));
        }
        if !(1..=300).contains(&self.request_timeout_secs) {
            return Err(ConfigError::Invalid(format!(
                "request_timeout_secs must be between 1 and 300, got {}",
                self.request_timeout_secs
            )));
        }
        if !(1..=64).contains(&self.max_concurrent_fetches) {
            return Err(ConfigError::Invalid(format!(
                "max_concurrent_fetches must be between 1 and 64, got {}",
                self.max_concurrent_fetches
            )));
        }
        if let Some(token_file) = &self.token_file {
            let path = Path::new(token_file);
            if token_file.trim().is_empty() || path.is_absolute() || token_file.contains("..") {
                return Err(ConfigError::Invalid(format!(
                    "token_file must be a file name inside the data directory, got {token_file:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn token_file_name(&self) -> &str {
        self.token_file.as_deref().unwrap_or(DEFAULT_TOKEN_FILE)
    }
}

/// Everything one refresh cycle needs from disk.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub repos: Vec<RepoRef>,
    pub settings: Settings,
    pub token: Option<String>,
}

pub struct ConfigStore {
    dir: PathBuf,
    fallback_token: Option<String>,
}

impl ConfigStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            fallback_token: None,
        }
    }

    /// Token used when the token file is absent or empty, normally taken from
    /// `GITHUB_TOKEN`.
    pub fn with_fallback_token(mut self, token: Option<String>) -> Self {
        self.fallback_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    pub fn load(&self) -> Result<ConfigSnapshot, ConfigError> {
        self.ensure_defaults()?;

        let settings = self.load_settings()?;
        let repos = self.load_repos()?;
        let token = self.load_token(&settings)?;

        Ok(ConfigSnapshot {
            repos,
            settings,
            token,
        })
    }

    fn ensure_defaults(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| ConfigError::Write {
            path: self.dir.clone(),
            source,
        })?;

        if !self.path(SETTINGS_FILE).exists() {
            info!("Settings file not found, writing defaults");
            self.save_settings(&Settings::default())?;
        }

        let repos_path = self.path(REPOS_FILE);
        if !repos_path.exists() {
            info!("Repository list not found, creating {}", repos_path.display());
            self.write_atomic(REPOS_FILE, REPOS_FILE_HEADER)?;
        }

        Ok(())
    }

    pub fn load_settings(&self) -> Result<Settings, ConfigError> {
        let path = self.path(SETTINGS_FILE);
        let content = read(&path)?;
        let settings: Settings =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse { path, source })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load_repos(&self) -> Result<Vec<RepoRef>, ConfigError> {
        let content = read(&self.path(REPOS_FILE))?;
        Ok(parse_repo_list(&content))
    }

    /// The repository list exactly as stored, comments included. A missing
    /// file reads as empty.
    pub fn load_repos_text(&self) -> Result<String, ConfigError> {
        let path = self.path(REPOS_FILE);
        if !path.exists() {
            return Ok(String::new());
        }
        read(&path)
    }

    fn load_token(&self, settings: &Settings) -> Result<Option<String>, ConfigError> {
        let path = self.path(settings.token_file_name());
        if path.exists() {
            let token = read(&path)?.trim().to_string();
            if !token.is_empty() {
                return Ok(Some(token));
            }
        }
        Ok(self.fallback_token.clone())
    }

    pub fn has_token(&self) -> bool {
        self.load_settings()
            .ok()
            .and_then(|settings| self.load_token(&settings).ok().flatten())
            .is_some()
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<(), ConfigError> {
        settings.validate()?;
        let json = serde_json::to_string_pretty(settings).map_err(|source| ConfigError::Parse {
            path: self.path(SETTINGS_FILE),
            source,
        })?;
        self.write_atomic(SETTINGS_FILE, &json)?;
        info!(
            poll_interval_secs = settings.poll_interval_secs,
            max_entries = settings.max_entries,
            "Settings saved"
        );
        Ok(())
    }

    pub fn save_repos(&self, repos: &[RepoRef]) -> Result<(), ConfigError> {
        let mut content = String::from(REPOS_FILE_HEADER);
        for repo in repos {
            content.push_str(&repo.to_string());
            content.push('\n');
        }
        self.write_atomic(REPOS_FILE, &content)?;
        info!("Saved {} repositories", repos.len());
        Ok(())
    }

    /// Store the token; an empty token removes the token file.
    pub fn save_token(&self, token: &str) -> Result<(), ConfigError> {
        let settings = self.load_settings().unwrap_or_default();
        let file = settings.token_file_name();
        let token = token.trim();

        if token.is_empty() {
            let path = self.path(file);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|source| ConfigError::Write { path, source })?;
            }
            info!("GitHub token cleared");
            return Ok(());
        }

        self.write_atomic(file, token)?;
        info!("GitHub token saved");
        Ok(())
    }

    fn write_atomic(&self, file: &str, content: &str) -> Result<(), ConfigError> {
        let path = self.path(file);
        let write_err = |source| ConfigError::Write {
            path: path.clone(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(write_err)?;
        tmp.write_all(content.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}
