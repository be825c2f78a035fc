use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::db::parse_datetime;
use crate::error::{AppError, Result};
use crate::models::{Novel, UpdateQueueEntry};

/// The novel API accepts at most this many ncodes per request.
const MAX_NCODES_PER_REQUEST: usize = 500;
const MAX_CONCURRENT_REQUESTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteStatus {
    pub ncode: String,
    #[serde(rename = "general_all_no", default)]
    pub total_episodes: i64,
    #[serde(rename = "general_lastup", default)]
    pub last_update: Option<String>,
}

impl RemoteStatus {
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update.as_deref().and_then(parse_datetime)
    }
}

pub struct NarouClient {
    client: Client,
    api_url: String,
}

impl NarouClient {
    pub fn new(api_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("nr-reader/1.0")
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.into(),
        })
    }

    fn request_url(&self, ncodes: &[String]) -> Result<Url> {
        let mut url = Url::parse(&self.api_url).map_err(|e| AppError::Config(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("out", "json")
            .append_pair("of", "n-ga-gl")
            .append_pair("lim", &MAX_NCODES_PER_REQUEST.to_string())
            .append_pair("ncode", &ncodes.join("-"));
        Ok(url)
    }

    pub async fn fetch_statuses(&self, ncodes: &[String]) -> Result<Vec<RemoteStatus>> {
        let response = self.client.get(self.request_url(ncodes)?).send().await?;

        if !response.status().is_success() {
            return Err(AppError::NarouApi(format!("HTTP {}", response.status())));
        }

        let body = response.text().await?;
        parse_api_response(&body)
    }

    /// Query every ncode, a few requests at a time. Failed requests are
    /// logged and left out.
    pub async fn fetch_all_statuses(&self, ncodes: Vec<String>) -> Vec<RemoteStatus> {
        let chunks: Vec<Vec<String>> = ncodes
            .chunks(MAX_NCODES_PER_REQUEST)
            .map(|c| c.to_vec())
            .collect();

        stream::iter(chunks)
            .map(|chunk| async move {
                match self.fetch_statuses(&chunk).await {
                    Ok(statuses) => {
                        tracing::debug!("Fetched {} novel statuses", statuses.len());
                        statuses
                    }
                    Err(e) => {
                        tracing::warn!("Failed to fetch novel statuses: {}", e);
                        Vec::new()
                    }
                }
            })
            .buffer_unordered(MAX_CONCURRENT_REQUESTS)
            .flat_map(stream::iter)
            .collect()
            .await
    }

    /// Save a remote catalog page so it can be parsed offline.
    pub async fn fetch_page(&self, url: &str, out: &Path) -> Result<u64> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Failed to fetch page: HTTP {}", response.status()).into());
        }

        let bytes = response.bytes().await?;
        if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(out, &bytes).await?;
        Ok(bytes.len() as u64)
    }
}

/// The response is a JSON array whose first element only carries the hit
/// count.
pub fn parse_api_response(body: &str) -> Result<Vec<RemoteStatus>> {
    let items: Vec<serde_json::Value> = serde_json::from_str(body)?;
    items
        .into_iter()
        .filter(|item| item.get("ncode").is_some())
        .map(|item| -> Result<RemoteStatus> {
            let mut status: RemoteStatus = serde_json::from_value(item)?;
            status.ncode = status.ncode.to_ascii_lowercase();
            Ok(status)
        })
        .collect()
}

/// Novels whose remote episode count is ahead of the local one.
pub fn diff_updates(local: &[Novel], remote: &[RemoteStatus], now: DateTime<Utc>) -> Vec<UpdateQueueEntry> {
    local
        .iter()
        .filter_map(|novel| {
            let status = remote.iter().find(|s| s.ncode == novel.ncode)?;
            (status.total_episodes > novel.total_episodes).then(|| UpdateQueueEntry {
                ncode: novel.ncode.clone(),
                total_episodes: status.total_episodes,
                detected_at: now,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn novel(ncode: &str, total: i64) -> Novel {
        Novel {
            ncode: ncode.to_string(),
            title: String::new(),
            author: String::new(),
            synopsis: String::new(),
            main_tags: vec![],
            sub_tags: vec![],
            rating: 0,
            total_episodes: total,
            last_update: Utc::now(),
            last_read_episode: 0,
        }
    }

    #[test]
    fn parses_api_array() {
        let body = r#"[{"allcount":2},
            {"ncode":"N0001AA","general_all_no":12,"general_lastup":"2024-05-01 12:00:00"},
            {"ncode":"N0002BB","general_all_no":3}]"#;
        let statuses = parse_api_response(body).unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].ncode, "n0001aa");
        assert_eq!(statuses[0].total_episodes, 12);
        assert!(statuses[0].last_update().is_some());
        assert_eq!(statuses[1].last_update, None);
    }

    #[test]
    fn only_novels_with_new_episodes_are_queued() {
        let local = vec![novel("n0001aa", 10), novel("n0002bb", 3), novel("n0003cc", 5)];
        let remote = vec![
            RemoteStatus { ncode: "n0001aa".into(), total_episodes: 12, last_update: None },
            RemoteStatus { ncode: "n0002bb".into(), total_episodes: 3, last_update: None },
        ];
        let now = Utc::now();
        let queued = diff_updates(&local, &remote, now);
        assert_eq!(
            queued,
            vec![UpdateQueueEntry { ncode: "n0001aa".into(), total_episodes: 12, detected_at: now }]
        );
    }

    #[test]
    fn request_url_joins_ncodes() {
        let client = NarouClient::new("https://api.syosetu.com/novelapi/api/").unwrap();
        let url = client
            .request_url(&["n0001aa".to_string(), "n0002bb".to_string()])
            .unwrap();
        assert!(url.as_str().contains("ncode=n0001aa-n0002bb"));
        assert!(url.as_str().contains("of=n-ga-gl"));
    }
}
