//! X (Twitter) v2 recent-search feed.
//!
//! One request per asset per tick; the cursor is the newest tweet id seen
//! (`since_id`). Author ids resolve to handles and photo attachments to
//! their URLs through the response `includes`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::histogram;
use serde::Deserialize;

use crate::error::FeedError;
use crate::ingest::normalize_text;
use crate::ingest::types::{FeedCursor, FeedPage, FeedSource};
use crate::model::{canonical_asset_tag, Mention};

pub const X_RECENT_SEARCH_URL: &str = "https://api.twitter.com/2/tweets/search/recent";

// API bounds for max_results.
const MIN_RESULTS: usize = 10;
const MAX_RESULTS: usize = 100;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Tweet>,
    #[serde(default)]
    includes: Includes,
    #[serde(default)]
    meta: Meta,
}

#[derive(Debug, Deserialize)]
struct Tweet {
    id: String,
    text: String,
    author_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    attachments: Option<Attachments>,
}

#[derive(Debug, Deserialize)]
struct Attachments {
    #[serde(default)]
    media_keys: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    media: Vec<Media>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct Media {
    media_key: String,
    #[serde(rename = "type")]
    kind: String,
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    newest_id: Option<String>,
}

/// Search query for an asset: name or cashtag, no retweets, English.
pub fn search_query(asset_tag: &str) -> String {
    let tag = canonical_asset_tag(asset_tag);
    format!("\"{tag}\" OR \"${tag}\" -is:retweet lang:en")
}

pub struct XRecentSearchFeed {
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http {
        url: String,
        bearer_token: String,
        client: reqwest::Client,
    },
}

impl XRecentSearchFeed {
    pub fn new(bearer_token: impl Into<String>) -> Self {
        Self::with_url(X_RECENT_SEARCH_URL, bearer_token)
    }

    pub fn with_url(url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            mode: Mode::Http {
                url: url.into(),
                bearer_token: bearer_token.into(),
                client: reqwest::Client::new(),
            },
        }
    }

    /// Serve a canned response body; `since` is applied as `since_id` would be.
    pub fn from_fixture_str(s: &str) -> Self {
        Self {
            mode: Mode::Fixture(s.to_string()),
        }
    }

    /// Parse a recent-search body into mentions for `asset_tag`.
    pub fn parse_response(
        body: &str,
        asset_tag: &str,
        since: Option<&FeedCursor>,
    ) -> Result<FeedPage, FeedError> {
        let t0 = std::time::Instant::now();
        let resp: SearchResponse = serde_json::from_str(body)
            .map_err(|e| FeedError::Transient(format!("parsing x search json: {e}")))?;

        let users: HashMap<&str, &str> = resp
            .includes
            .users
            .iter()
            .map(|u| (u.id.as_str(), u.username.as_str()))
            .collect();
        let photos: HashMap<&str, &str> = resp
            .includes
            .media
            .iter()
            .filter(|m| m.kind == "photo")
            .filter_map(|m| m.url.as_deref().map(|u| (m.media_key.as_str(), u)))
            .collect();

        let now = Utc::now();
        let tag = canonical_asset_tag(asset_tag);
        let batch_id = format!("{}-{}", tag, now.timestamp_millis());
        let since_num = since.and_then(|c| c.0.parse::<u128>().ok());

        let mut mentions = Vec::with_capacity(resp.data.len());
        for tw in resp.data {
            if let (Some(floor), Ok(id)) = (since_num, tw.id.parse::<u128>()) {
                if id <= floor {
                    continue;
                }
            }
            let body_text = normalize_text(&tw.text);
            if body_text.is_empty() {
                continue;
            }
            let media_refs = tw
                .attachments
                .map(|a| {
                    a.media_keys
                        .iter()
                        .filter_map(|k| photos.get(k.as_str()).map(|u| u.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            let author_handle = tw
                .author_id
                .as_deref()
                .and_then(|id| users.get(id).copied())
                .unwrap_or("Unknown")
                .to_string();
            mentions.push(Mention {
                source_id: tw.id,
                asset_tag: tag.clone(),
                author_handle,
                body_text,
                media_refs,
                observed_at: tw.created_at.unwrap_or(now),
                fetch_batch_id: batch_id.clone(),
            });
        }

        let next_cursor = resp
            .meta
            .newest_id
            .or_else(|| max_numeric_id(&mentions))
            .map(FeedCursor);

        histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(FeedPage {
            mentions,
            next_cursor,
        })
    }
}

fn max_numeric_id(mentions: &[Mention]) -> Option<String> {
    mentions
        .iter()
        .filter_map(|m| m.source_id.parse::<u128>().ok())
        .max()
        .map(|n| n.to_string())
}

fn reset_from_headers(headers: &reqwest::header::HeaderMap) -> Option<DateTime<Utc>> {
    headers
        .get("x-rate-limit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

#[async_trait]
impl FeedSource for XRecentSearchFeed {
    async fn fetch_mentions(
        &self,
        asset_tag: &str,
        since: Option<&FeedCursor>,
        limit: usize,
    ) -> Result<FeedPage, FeedError> {
        match &self.mode {
            Mode::Fixture(s) => Self::parse_response(s, asset_tag, since),
            Mode::Http {
                url,
                bearer_token,
                client,
            } => {
                let max_results = limit.clamp(MIN_RESULTS, MAX_RESULTS).to_string();
                let mut query = vec![
                    ("query", search_query(asset_tag)),
                    ("max_results", max_results),
                    ("tweet.fields", "created_at,attachments".to_string()),
                    ("expansions", "author_id,attachments.media_keys".to_string()),
                    ("media.fields", "url,type".to_string()),
                    ("user.fields", "username".to_string()),
                ];
                if let Some(c) = since {
                    query.push(("since_id", c.0.clone()));
                }

                let resp = client
                    .get(url.as_str())
                    .bearer_auth(bearer_token)
                    .query(&query)
                    .send()
                    .await
                    .map_err(|e| FeedError::Transient(format!("x search request: {e}")))?;

                let status = resp.status();
                if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    return Err(FeedError::RateLimited {
                        reset_at: reset_from_headers(resp.headers()),
                    });
                }
                let body = resp
                    .text()
                    .await
                    .map_err(|e| FeedError::Transient(format!("x search body: {e}")))?;
                if !status.is_success() {
                    return Err(FeedError::Transient(format!(
                        "x search returned {status}: {}",
                        body.chars().take(200).collect::<String>()
                    )));
                }
                Self::parse_response(&body, asset_tag, since)
            }
        }
    }

    fn name(&self) -> &'static str {
        "x-recent-search"
    }
}
