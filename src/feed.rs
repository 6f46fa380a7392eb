use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rss::{Category, Channel, Guid, Image, Item, Source};
use thiserror::Error;
use tracing::warn;

use crate::config::ChannelConfig;
use crate::fetcher::ReleaseRecord;

pub const DEFAULT_MAX_ENTRIES: usize = 100;
const MAX_DESCRIPTION_CHARS: usize = 500;
const GENERATOR: &str = concat!("github-release-feed ", env!("CARGO_PKG_VERSION"));
const GITHUB_FAVICON: &str = "https://github.githubassets.com/favicons/favicon.png";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("release {repo}@{tag} has an unusable link {link:?}")]
    InvalidRecord {
        repo: String,
        tag: String,
        link: String,
    },

    #[error("failed to serialize feed: {0}")]
    Write(#[from] rss::Error),

    #[error("feed is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Newest first; equal timestamps ordered by repository, then URL.
pub fn compare_records(a: &ReleaseRecord, b: &ReleaseRecord) -> Ordering {
    b.published_at
        .cmp(&a.published_at)
        .then_with(|| a.repo.to_string().cmp(&b.repo.to_string()))
        .then_with(|| a.url.cmp(&b.url))
}

/// Merge records from all repositories into feed order, dropping the ones
/// that cannot become an item, and keep at most `max_entries`.
pub fn select_records(mut records: Vec<ReleaseRecord>, max_entries: usize) -> Vec<ReleaseRecord> {
    records.retain(|record| match validate_record(record) {
        Ok(()) => true,
        Err(e) => {
            warn!("Omitting release from feed: {}", e);
            false
        }
    });
    records.sort_by(compare_records);
    records.truncate(max_entries);
    records
}

fn validate_record(record: &ReleaseRecord) -> Result<(), BuildError> {
    match reqwest::Url::parse(&record.url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        _ => Err(BuildError::InvalidRecord {
            repo: record.repo.to_string(),
            tag: record.tag.clone(),
            link: record.url.clone(),
        }),
    }
}

/// RFC 822 date as used by RSS 2.0, always in GMT.
pub fn rfc822(dt: &DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Drop characters XML 1.0 cannot carry at all. Markup characters are escaped
/// by the writer.
fn xml_safe(text: &str) -> String {
    text.chars()
        .filter(|&c| matches!(c, '\t' | '\n' | '\r') || !c.is_control())
        .filter(|&c| c != '\u{FFFE}' && c != '\u{FFFF}')
        .collect()
}

fn truncate_description(body: &str) -> String {
    // Descriptions may be emitted as CDATA, which cannot contain its own terminator.
    let body = xml_safe(body.trim()).replace("]]>", "]] >");
    if body.chars().count() <= MAX_DESCRIPTION_CHARS {
        return body;
    }
    let mut truncated: String = body.chars().take(MAX_DESCRIPTION_CHARS).collect();
    truncated.push_str("...");
    truncated
}

fn item_from_record(record: &ReleaseRecord) -> Item {
    let repo = record.repo.to_string();
    let mut item = Item::default();

    item.set_title(format!("{}: {}", repo, xml_safe(&record.title)));
    item.set_link(record.url.clone());

    let mut guid = Guid::default();
    guid.set_value(format!("{}@{}", repo, xml_safe(&record.tag)));
    guid.set_permalink(false);
    item.set_guid(guid);

    item.set_pub_date(rfc822(&record.published_at));

    if let Some(author) = &record.author {
        item.set_author(format!("noreply@github.com ({})", xml_safe(author)));
    }

    let description = truncate_description(&record.body);
    if !description.is_empty() {
        item.set_description(description);
    }

    let mut category = Category::default();
    category.set_name(repo.clone());
    item.set_categories(vec![category]);

    let mut source = Source::default();
    source.set_url(record.repo.releases_page());
    source.set_title(format!("GitHub - {}", repo));
    item.set_source(source);

    item
}

/// Serializes release records into an RSS 2.0 document.
#[derive(Debug, Clone)]
pub struct FeedBuilder {
    channel: ChannelConfig,
    ttl_minutes: Option<u64>,
}

impl FeedBuilder {
    pub fn new(channel: ChannelConfig) -> Self {
        Self {
            channel,
            ttl_minutes: None,
        }
    }

    /// Advertise a refresh hint (`<ttl>`) to feed readers.
    pub fn with_ttl(mut self, poll_interval_secs: u64) -> Self {
        self.ttl_minutes = Some((poll_interval_secs / 60).max(1));
        self
    }

    pub fn build(&self, records: Vec<ReleaseRecord>, max_entries: usize) -> Result<String, BuildError> {
        self.build_at(records, max_entries, Utc::now())
    }

    pub fn build_at(
        &self,
        records: Vec<ReleaseRecord>,
        max_entries: usize,
        built_at: DateTime<Utc>,
    ) -> Result<String, BuildError> {
        let records = select_records(records, max_entries);
        self.render(&records, built_at)
    }

    /// Render records that are already selected and ordered.
    pub fn render(&self, records: &[ReleaseRecord], built_at: DateTime<Utc>) -> Result<String, BuildError> {
        let mut channel = Channel::default();
        channel.set_title(self.channel.title.clone());
        channel.set_link(self.channel.link.clone());
        channel.set_description(self.channel.description.clone());
        channel.set_last_build_date(rfc822(&built_at));
        channel.set_generator(GENERATOR.to_string());
        if let Some(ttl) = self.ttl_minutes {
            channel.set_ttl(ttl.to_string());
        }

        let mut image = Image::default();
        image.set_url(GITHUB_FAVICON.to_string());
        image.set_title(self.channel.title.clone());
        image.set_link(self.channel.link.clone());
        channel.set_image(image);

        channel.set_items(records.iter().map(item_from_record).collect::<Vec<_>>());

        let bytes = channel.write_to(Vec::new())?;
        Ok(String::from_utf8(bytes)?)
    }
}
