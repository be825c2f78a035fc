use std::path::Path;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::{AppError, Result};
use crate::models::{join_tags, split_tags, Episode, Imported, LastRead, Novel, UpdateQueueEntry};

use super::schema::{EPISODES_TABLE, LAST_READ_TABLE, NOVELS_TABLE, SCHEMA, UPDATE_QUEUE_TABLE};

/// Handle to the working database. Cloning shares the same connection thread.
#[derive(Clone)]
pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).await?;

        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    pub async fn close(self) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }

    // Novel operations

    /// Insert or update a batch of novels in one transaction.
    pub async fn upsert_novels(&self, novels: Vec<Novel>) -> Result<usize> {
        self.merge_novels(novels.into_iter().map(Imported::known).collect())
            .await
    }

    /// Like [`Repository::upsert_novels`], but rows without a known update
    /// time keep the stored one.
    pub async fn merge_novels(&self, novels: Vec<Imported<Novel>>) -> Result<usize> {
        let count = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        r#"INSERT INTO novels_descs
                               (ncode, title, author, synopsis, main_tags, sub_tags, rating, total_ep, general_lastup)
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                           ON CONFLICT(ncode) DO UPDATE SET
                               title = excluded.title,
                               author = excluded.author,
                               synopsis = excluded.synopsis,
                               main_tags = excluded.main_tags,
                               sub_tags = excluded.sub_tags,
                               rating = excluded.rating,
                               total_ep = excluded.total_ep,
                               general_lastup = CASE WHEN ?10 THEN excluded.general_lastup
                                                     ELSE novels_descs.general_lastup END"#,
                    )?;
                    for Imported { record: novel, timestamp_known } in &novels {
                        stmt.execute(params![
                            novel.ncode,
                            novel.title,
                            novel.author,
                            novel.synopsis,
                            join_tags(&novel.main_tags),
                            join_tags(&novel.sub_tags),
                            novel.rating,
                            novel.total_episodes,
                            format_datetime(&novel.last_update),
                            timestamp_known,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(novels.len())
            })
            .await?;
        Ok(count)
    }

    pub async fn get_all_novels(&self) -> Result<Vec<Novel>> {
        let novels = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT n.ncode, n.title, n.author, n.synopsis, n.main_tags, n.sub_tags,
                              n.rating, n.total_ep, n.general_lastup, COALESCE(l.episode_no, 0)
                       FROM novels_descs n
                       LEFT JOIN last_read_novel l ON l.ncode = n.ncode
                       ORDER BY n.general_lastup DESC, n.ncode"#,
                )?;
                let novels = stmt
                    .query_map([], novel_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(novels)
            })
            .await?;
        Ok(novels)
    }

    pub async fn get_novel(&self, ncode: &str) -> Result<Option<Novel>> {
        let ncode = ncode.to_string();
        let novel = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT n.ncode, n.title, n.author, n.synopsis, n.main_tags, n.sub_tags,
                              n.rating, n.total_ep, n.general_lastup, COALESCE(l.episode_no, 0)
                       FROM novels_descs n
                       LEFT JOIN last_read_novel l ON l.ncode = n.ncode
                       WHERE n.ncode = ?1"#,
                )?;
                let novel = stmt.query_row(params![ncode], novel_from_row).optional()?;
                Ok(novel)
            })
            .await?;
        Ok(novel)
    }

    pub async fn update_tags(&self, ncode: &str, main_tags: Vec<String>, sub_tags: Vec<String>) -> Result<()> {
        let key = ncode.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE novels_descs SET main_tags = ?1, sub_tags = ?2 WHERE ncode = ?3",
                    params![join_tags(&main_tags), join_tags(&sub_tags), key],
                )?;
                Ok(changed)
            })
            .await?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("novel {ncode}")));
        }
        Ok(())
    }

    // Episode operations

    pub async fn upsert_episodes(&self, episodes: Vec<Episode>) -> Result<usize> {
        self.merge_episodes(episodes.into_iter().map(Imported::known).collect())
            .await
    }

    /// Rows without a known update time keep the stored one.
    pub async fn merge_episodes(&self, episodes: Vec<Imported<Episode>>) -> Result<usize> {
        let count = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        r#"INSERT INTO episodes (ncode, episode_no, e_title, body, update_time)
                           VALUES (?1, ?2, ?3, ?4, ?5)
                           ON CONFLICT(ncode, episode_no) DO UPDATE SET
                               e_title = excluded.e_title,
                               body = excluded.body,
                               update_time = CASE WHEN ?6 THEN excluded.update_time
                                                  ELSE episodes.update_time END"#,
                    )?;
                    for Imported { record: episode, timestamp_known } in &episodes {
                        stmt.execute(params![
                            episode.ncode,
                            episode.episode_no,
                            episode.title,
                            episode.body,
                            format_datetime(&episode.updated_at),
                            timestamp_known,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(episodes.len())
            })
            .await?;
        Ok(count)
    }

    /// Episodes of a novel in numeric order.
    pub async fn get_episodes(&self, ncode: &str) -> Result<Vec<Episode>> {
        let ncode = ncode.to_string();
        let episodes = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT ncode, episode_no, e_title, body, update_time
                       FROM episodes
                       WHERE ncode = ?1
                       ORDER BY CAST(episode_no AS INTEGER), episode_no"#,
                )?;
                let episodes = stmt
                    .query_map(params![ncode], episode_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(episodes)
            })
            .await?;
        Ok(episodes)
    }

    pub async fn get_episode(&self, ncode: &str, episode_no: i64) -> Result<Option<Episode>> {
        let ncode = ncode.to_string();
        let episode = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT ncode, episode_no, e_title, body, update_time
                       FROM episodes
                       WHERE ncode = ?1 AND CAST(episode_no AS INTEGER) = ?2
                       LIMIT 1"#,
                )?;
                let episode = stmt
                    .query_row(params![ncode, episode_no], episode_from_row)
                    .optional()?;
                Ok(episode)
            })
            .await?;
        Ok(episode)
    }

    // Bookmark operations

    /// Store a bookmark unless a newer one already exists for the novel.
    pub async fn upsert_last_read(&self, last_read: LastRead) -> Result<()> {
        self.merge_last_read(Imported::known(last_read)).await
    }

    /// A bookmark without a known date only fills a missing one; it never
    /// replaces an existing bookmark.
    pub async fn merge_last_read(&self, last_read: Imported<LastRead>) -> Result<()> {
        let Imported { record: last_read, timestamp_known } = last_read;
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"INSERT INTO last_read_novel (ncode, date, episode_no)
                       VALUES (?1, ?2, ?3)
                       ON CONFLICT(ncode) DO UPDATE SET
                           date = excluded.date,
                           episode_no = excluded.episode_no
                       WHERE ?4 AND excluded.date >= last_read_novel.date"#,
                    params![
                        last_read.ncode,
                        format_datetime(&last_read.date),
                        last_read.episode_no,
                        timestamp_known,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn mark_episode_read(&self, ncode: &str, episode_no: i64) -> Result<()> {
        self.upsert_last_read(LastRead {
            ncode: ncode.to_string(),
            date: Utc::now(),
            episode_no,
        })
        .await
    }

    pub async fn get_last_read(&self, ncode: &str) -> Result<Option<LastRead>> {
        let ncode = ncode.to_string();
        let last_read = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT ncode, date, episode_no FROM last_read_novel WHERE ncode = ?1")?;
                let last_read = stmt
                    .query_row(params![ncode], |row| {
                        Ok(LastRead {
                            ncode: row.get(0)?,
                            date: datetime_or_now(row.get::<_, Option<String>>(1)?),
                            episode_no: row.get(2)?,
                        })
                    })
                    .optional()?;
                Ok(last_read)
            })
            .await?;
        Ok(last_read)
    }

    pub async fn delete_last_read(&self, ncode: &str) -> Result<()> {
        let ncode = ncode.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM last_read_novel WHERE ncode = ?1", params![ncode])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Update queue

    pub async fn enqueue_updates(&self, entries: Vec<UpdateQueueEntry>) -> Result<usize> {
        let count = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT OR REPLACE INTO update_queue (ncode, total_ep, detected_at) VALUES (?1, ?2, ?3)",
                    )?;
                    for entry in &entries {
                        stmt.execute(params![
                            entry.ncode,
                            entry.total_episodes,
                            format_datetime(&entry.detected_at)
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(entries.len())
            })
            .await?;
        Ok(count)
    }

    pub async fn get_update_queue(&self) -> Result<Vec<UpdateQueueEntry>> {
        let entries = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT ncode, total_ep, detected_at FROM update_queue ORDER BY detected_at DESC, ncode",
                )?;
                let entries = stmt
                    .query_map([], |row| {
                        Ok(UpdateQueueEntry {
                            ncode: row.get(0)?,
                            total_episodes: row.get(1)?,
                            detected_at: datetime_or_now(row.get::<_, Option<String>>(2)?),
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await?;
        Ok(entries)
    }

    pub async fn remove_from_update_queue(&self, ncode: &str) -> Result<()> {
        let ncode = ncode.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM update_queue WHERE ncode = ?1", params![ncode])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn count_rows(&self, table: &str) -> Result<i64> {
        let sql = match table {
            NOVELS_TABLE => "SELECT COUNT(*) FROM novels_descs",
            EPISODES_TABLE => "SELECT COUNT(*) FROM episodes",
            LAST_READ_TABLE => "SELECT COUNT(*) FROM last_read_novel",
            UPDATE_QUEUE_TABLE => "SELECT COUNT(*) FROM update_queue",
            other => return Err(AppError::NotFound(format!("table {other}"))),
        };
        let count = self
            .conn
            .call(move |conn| Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))?))
            .await?;
        Ok(count)
    }
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Accepts RFC 3339, SQLite `datetime()` text, and epoch seconds or
/// milliseconds written as digits.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56+00:00")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    s.parse::<i64>().ok().and_then(datetime_from_epoch)
}

/// Values above 10^11 are taken as milliseconds.
pub(crate) fn datetime_from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() > 100_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

fn datetime_or_now(value: Option<String>) -> DateTime<Utc> {
    value
        .as_deref()
        .and_then(parse_datetime)
        .unwrap_or_else(Utc::now)
}

fn novel_from_row(row: &Row) -> rusqlite::Result<Novel> {
    Ok(Novel {
        ncode: row.get(0)?,
        title: row.get(1)?,
        author: row.get(2)?,
        synopsis: row.get(3)?,
        main_tags: split_tags(&row.get::<_, String>(4)?),
        sub_tags: split_tags(&row.get::<_, String>(5)?),
        rating: row.get(6)?,
        total_episodes: row.get(7)?,
        last_update: datetime_or_now(row.get::<_, Option<String>>(8)?),
        last_read_episode: row.get(9)?,
    })
}

fn episode_from_row(row: &Row) -> rusqlite::Result<Episode> {
    Ok(Episode {
        ncode: row.get(0)?,
        episode_no: row.get(1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        updated_at: datetime_or_now(row.get::<_, Option<String>>(4)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn sample_novel(ncode: &str, total: i64) -> Novel {
        Novel {
            ncode: ncode.to_string(),
            title: format!("title {ncode}"),
            author: "author".to_string(),
            synopsis: "synopsis".to_string(),
            main_tags: vec!["fantasy".to_string()],
            sub_tags: vec!["a".to_string(), "b".to_string()],
            rating: 42,
            total_episodes: total,
            last_update: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            last_read_episode: 0,
        }
    }

    fn sample_episode(ncode: &str, no: &str) -> Episode {
        Episode {
            ncode: ncode.to_string(),
            episode_no: no.to_string(),
            title: format!("ep {no}"),
            body: "body".to_string(),
            updated_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    async fn setup_repo() -> (Repository, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::new(dir.path().join("test.db")).await.unwrap();
        (repo, dir)
    }

    #[tokio::test]
    async fn novels_upsert_replaces_by_ncode() {
        let (repo, _dir) = setup_repo().await;

        repo.upsert_novels(vec![sample_novel("n0001aa", 10), sample_novel("n0002bb", 3)])
            .await
            .unwrap();
        repo.upsert_novels(vec![sample_novel("n0001aa", 12)]).await.unwrap();

        assert_eq!(repo.count_rows(NOVELS_TABLE).await.unwrap(), 2);
        let novel = repo.get_novel("n0001aa").await.unwrap().unwrap();
        assert_eq!(novel.total_episodes, 12);
        assert_eq!(novel.sub_tags, vec!["a", "b"]);
        assert_eq!(novel.last_update, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn unknown_timestamps_keep_the_stored_ones() {
        let (repo, _dir) = setup_repo().await;
        repo.upsert_novels(vec![sample_novel("n0001aa", 10)]).await.unwrap();
        repo.upsert_episodes(vec![sample_episode("n0001aa", "1")]).await.unwrap();

        let mut novel = sample_novel("n0001aa", 11);
        novel.last_update = Utc::now();
        repo.merge_novels(vec![Imported { record: novel, timestamp_known: false }])
            .await
            .unwrap();
        let mut episode = sample_episode("n0001aa", "1");
        episode.title = "renamed".to_string();
        episode.updated_at = Utc::now();
        repo.merge_episodes(vec![Imported { record: episode, timestamp_known: false }])
            .await
            .unwrap();

        let stored = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let novel = repo.get_novel("n0001aa").await.unwrap().unwrap();
        assert_eq!(novel.total_episodes, 11);
        assert_eq!(novel.last_update, stored);
        let episode = repo.get_episode("n0001aa", 1).await.unwrap().unwrap();
        assert_eq!(episode.title, "renamed");
        assert_eq!(episode.updated_at, stored);
    }

    #[tokio::test]
    async fn episodes_are_ordered_numerically() {
        let (repo, _dir) = setup_repo().await;

        repo.upsert_episodes(vec![
            sample_episode("n0001aa", "10"),
            sample_episode("n0001aa", "2"),
            sample_episode("n0001aa", "1"),
            sample_episode("n0002bb", "1"),
        ])
        .await
        .unwrap();

        let numbers: Vec<String> = repo
            .get_episodes("n0001aa")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.episode_no)
            .collect();
        assert_eq!(numbers, vec!["1", "2", "10"]);

        let ep = repo.get_episode("n0001aa", 10).await.unwrap().unwrap();
        assert_eq!(ep.title, "ep 10");
        assert!(repo.get_episode("n0001aa", 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn newest_bookmark_wins() {
        let (repo, _dir) = setup_repo().await;
        repo.upsert_novels(vec![sample_novel("n0001aa", 10)]).await.unwrap();

        let now = Utc::now();
        repo.upsert_last_read(LastRead {
            ncode: "n0001aa".to_string(),
            date: now,
            episode_no: 5,
        })
        .await
        .unwrap();
        repo.upsert_last_read(LastRead {
            ncode: "n0001aa".to_string(),
            date: now - Duration::days(1),
            episode_no: 2,
        })
        .await
        .unwrap();

        let bookmark = repo.get_last_read("n0001aa").await.unwrap().unwrap();
        assert_eq!(bookmark.episode_no, 5);
        assert_eq!(repo.count_rows(LAST_READ_TABLE).await.unwrap(), 1);

        let novel = repo.get_novel("n0001aa").await.unwrap().unwrap();
        assert_eq!(novel.last_read_episode, 5);
        assert_eq!(novel.unread_count(), 5);

        repo.mark_episode_read("n0001aa", 7).await.unwrap();
        assert_eq!(repo.get_last_read("n0001aa").await.unwrap().unwrap().episode_no, 7);

        repo.delete_last_read("n0001aa").await.unwrap();
        assert!(repo.get_last_read("n0001aa").await.unwrap().is_none());
        let novel = repo.get_novel("n0001aa").await.unwrap().unwrap();
        assert_eq!(novel.last_read_episode, 0);
    }

    #[tokio::test]
    async fn update_tags_reports_missing_novel() {
        let (repo, _dir) = setup_repo().await;
        repo.upsert_novels(vec![sample_novel("n0001aa", 1)]).await.unwrap();

        repo.update_tags("n0001aa", vec!["x".to_string()], vec![])
            .await
            .unwrap();
        let novel = repo.get_novel("n0001aa").await.unwrap().unwrap();
        assert_eq!(novel.main_tags, vec!["x"]);
        assert!(novel.sub_tags.is_empty());

        let err = repo.update_tags("n9999zz", vec![], vec![]).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_queue_lifecycle() {
        let (repo, _dir) = setup_repo().await;
        let entry = UpdateQueueEntry {
            ncode: "n0001aa".to_string(),
            total_episodes: 11,
            detected_at: Utc::now(),
        };
        repo.enqueue_updates(vec![entry.clone(), entry]).await.unwrap();

        let queue = repo.get_update_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].total_episodes, 11);

        repo.remove_from_update_queue("n0001aa").await.unwrap();
        assert!(repo.get_update_queue().await.unwrap().is_empty());
    }

    #[test]
    fn parses_known_datetime_forms() {
        let expected = Utc.with_ymd_and_hms(2026, 1, 11, 12, 34, 56).unwrap();
        assert_eq!(parse_datetime("2026-01-11T12:34:56+00:00"), Some(expected));
        assert_eq!(parse_datetime("2026-01-11 12:34:56"), Some(expected));
        assert_eq!(parse_datetime(&expected.timestamp().to_string()), Some(expected));
        assert_eq!(parse_datetime(&expected.timestamp_millis().to_string()), Some(expected));
        assert_eq!(parse_datetime("yesterday"), None);
    }
}
