use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Novel {
    pub ncode: String,
    pub title: String,
    pub author: String,
    pub synopsis: String,
    pub main_tags: Vec<String>,
    pub sub_tags: Vec<String>,
    pub rating: i64,
    pub total_episodes: i64,
    pub last_update: DateTime<Utc>,
    /// Episode number of the current bookmark, 0 when the novel was never opened.
    #[serde(default)]
    pub last_read_episode: i64,
}

impl Novel {
    pub fn unread_count(&self) -> i64 {
        (self.total_episodes - self.last_read_episode).max(0)
    }

    pub fn page_url(&self, base_url: &str) -> String {
        format!("{}/{}/", base_url.trim_end_matches('/'), self.ncode)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub ncode: String,
    /// Stored as text, always ordered numerically.
    pub episode_no: String,
    pub title: String,
    pub body: String,
    pub updated_at: DateTime<Utc>,
}

impl Episode {
    pub fn number(&self) -> i64 {
        self.episode_no.trim().parse().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastRead {
    pub ncode: String,
    pub date: DateTime<Utc>,
    pub episode_no: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateQueueEntry {
    pub ncode: String,
    pub total_episodes: i64,
    pub detected_at: DateTime<Utc>,
}

/// A row read from another database. When `timestamp_known` is false the
/// source had no usable time: the record's time is only used for a first
/// insert and an existing row keeps its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Imported<T> {
    pub record: T,
    pub timestamp_known: bool,
}

impl<T> Imported<T> {
    pub fn known(record: T) -> Self {
        Self {
            record,
            timestamp_known: true,
        }
    }
}

pub fn split_tags(stored: &str) -> Vec<String> {
    stored.split_whitespace().map(str::to_string).collect()
}

pub fn join_tags(tags: &[String]) -> String {
    tags.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
