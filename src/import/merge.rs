//! Row-level import: upsert every row of an external database into the
//! working one.
//!
//! Phases run strictly in order and report cumulative progress:
//! preparing (0.1), compatibility check (0.2), descriptions (0.3 to 0.6),
//! episodes (0.6 to 0.9), bookmarks (0.9 to 1.0). Each batch commits on its
//! own; a failure part way keeps the batches already written, which is safe
//! because every write is keyed on the natural id.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use reqwest::Client;
use rusqlite::types::Value;
use rusqlite::OpenFlags;
use tokio_rusqlite::Connection;

use super::columns::{find_table, resolve_columns, ColumnMap, TableSpec, EPISODES, LAST_READ, NOVELS, REQUIRED_TABLES};
use super::{ImportSource, ProgressReporter};
use crate::db::{datetime_from_epoch, parse_datetime, Repository};
use crate::error::{AppError, Result};
use crate::models::{split_tags, Episode, Imported, LastRead, Novel};

pub const NOVEL_BATCH_SIZE: usize = 50;
pub const EPISODE_BATCH_SIZE: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub novels: usize,
    pub episodes: usize,
    pub last_reads: usize,
    /// Rows without a usable key.
    pub skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Read from a temporary copy even when the source is a local file.
    pub snapshot: bool,
    /// Where temporary copies go; the system temp dir if `None`.
    pub scratch_dir: Option<PathBuf>,
}

struct ExternalTables {
    novels: ColumnMap,
    episodes: ColumnMap,
    last_read: ColumnMap,
}

pub async fn merge_external_database(
    repo: &Repository,
    source: &ImportSource,
    client: &Client,
    options: MergeOptions,
    progress: &ProgressReporter,
) -> Result<SyncReport> {
    progress.report("Preparing", 0.0);
    tracing::info!("Merging external database {}", source.display());

    let local = source
        .materialize(client, options.snapshot, options.scratch_dir.as_deref())
        .await?;
    if local.is_temporary() {
        tracing::debug!("Reading {} from a temporary copy", source.display());
    }
    let external = Connection::open_with_flags(
        local.path(),
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .await
    .map_err(|e| AppError::access(source.display(), e))?;
    progress.report("Checking compatibility", 0.1);

    let tables = check_compatibility(&external, source).await?;
    progress.report("Database is compatible", 0.2);

    let mut report = SyncReport::default();

    progress.report("Importing novel descriptions", 0.3);
    let total = count(&external, &tables.novels).await?;
    let mut offset = 0;
    loop {
        let rows = read_page(&external, &tables.novels, NOVEL_BATCH_SIZE, offset).await?;
        if rows.is_empty() {
            break;
        }
        offset += rows.len();
        let (novels, skipped): (Vec<_>, Vec<_>) = rows
            .iter()
            .map(Vec::as_slice)
            .map(novel_from_values)
            .partition(Option::is_some);
        report.skipped += skipped.len();
        report.novels += repo.merge_novels(novels.into_iter().flatten().collect()).await?;
        progress.report(
            format!("Novel descriptions {offset}/{total}"),
            phase_fraction(0.3, 0.6, offset, total),
        );
    }

    let total = count(&external, &tables.episodes).await?;
    offset = 0;
    loop {
        let rows = read_page(&external, &tables.episodes, EPISODE_BATCH_SIZE, offset).await?;
        if rows.is_empty() {
            break;
        }
        offset += rows.len();
        let (episodes, skipped): (Vec<_>, Vec<_>) = rows
            .iter()
            .map(Vec::as_slice)
            .map(episode_from_values)
            .partition(Option::is_some);
        report.skipped += skipped.len();
        report.episodes += repo.merge_episodes(episodes.into_iter().flatten().collect()).await?;
        progress.report(
            format!("Episodes {offset}/{total}"),
            phase_fraction(0.6, 0.9, offset, total),
        );
    }
    progress.report("Importing reading positions", 0.9);

    let total = count(&external, &tables.last_read).await?;
    let rows = read_page(&external, &tables.last_read, total.max(1), 0).await?;
    for (i, row) in rows.iter().enumerate() {
        match last_read_from_values(row) {
            Some(last_read) => {
                repo.merge_last_read(last_read).await?;
                report.last_reads += 1;
            }
            None => report.skipped += 1,
        }
        progress.report(
            format!("Reading positions {}/{}", i + 1, total),
            phase_fraction(0.9, 1.0, i + 1, total),
        );
    }

    if let Err(e) = external.close().await {
        tracing::debug!("Closing external database failed: {}", e);
    }
    progress.report("Import finished", 1.0);
    tracing::info!(
        "Imported {} novels, {} episodes, {} reading positions ({} rows skipped)",
        report.novels,
        report.episodes,
        report.last_reads,
        report.skipped
    );
    Ok(report)
}

/// Fails unless the database file at `path` holds the tables and key columns
/// an import reads.
pub(crate) async fn verify_database(path: &Path, source: &ImportSource) -> Result<()> {
    let external = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .await
    .map_err(|e| AppError::access(source.display(), e))?;
    let checked = check_compatibility(&external, source).await;
    external.close().await?;
    checked.map(|_| ())
}

async fn check_compatibility(external: &Connection, source: &ImportSource) -> Result<ExternalTables> {
    let tables = external
        .call(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
        .map_err(|e| AppError::access(source.display(), e))?;

    let missing: Vec<String> = REQUIRED_TABLES
        .iter()
        .filter(|spec| find_table(spec, &tables).is_none())
        .map(|spec| spec.canonical_name().to_string())
        .collect();
    if !missing.is_empty() {
        tracing::warn!("External database is missing tables: {}", missing.join(", "));
        return Err(AppError::IncompatibleSchema { missing });
    }

    let mut missing = Vec::new();
    let mut maps = Vec::new();
    for spec in REQUIRED_TABLES {
        let table = find_table(spec, &tables).unwrap_or_default();
        let actual = table_columns(external, &table).await?;
        match resolve_columns(spec, &table, &actual) {
            Ok(map) => maps.push(map),
            Err(columns) => missing.extend(columns),
        }
    }
    if !missing.is_empty() {
        return Err(AppError::IncompatibleSchema { missing });
    }

    let mut maps = maps.into_iter();
    match (maps.next(), maps.next(), maps.next()) {
        (Some(novels), Some(episodes), Some(last_read)) => Ok(ExternalTables {
            novels,
            episodes,
            last_read,
        }),
        _ => Err(AppError::IncompatibleSchema {
            missing: REQUIRED_TABLES.iter().map(|s| s.canonical_name().to_string()).collect(),
        }),
    }
}

async fn table_columns(external: &Connection, table: &str) -> Result<Vec<String>> {
    let sql = format!("PRAGMA table_info(\"{}\")", table.replace('"', "\"\""));
    let columns = external
        .call(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(columns)
        })
        .await?;
    Ok(columns)
}

async fn count(external: &Connection, map: &ColumnMap) -> Result<usize> {
    let sql = map.count_sql();
    let count = external
        .call(move |conn| Ok(conn.query_row(&sql, [], |row| row.get::<_, i64>(0))?))
        .await?;
    Ok(count.max(0) as usize)
}

async fn read_page(external: &Connection, map: &ColumnMap, limit: usize, offset: usize) -> Result<Vec<Vec<Value>>> {
    let sql = map.select_sql();
    let width = map.columns.len();
    let rows = external
        .call(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([limit as i64, offset as i64], |row| {
                    (0..width).map(|i| row.get::<_, Value>(i)).collect()
                })?
                .collect::<std::result::Result<Vec<Vec<Value>>, _>>()?;
            Ok(rows)
        })
        .await?;
    Ok(rows)
}

fn phase_fraction(start: f32, end: f32, done: usize, total: usize) -> f32 {
    if total == 0 {
        return end;
    }
    start + (end - start) * (done.min(total) as f32 / total as f32)
}

static NULL: Value = Value::Null;

fn field<'a>(spec: &TableSpec, row: &'a [Value], name: &str) -> &'a Value {
    spec.position(name).and_then(|i| row.get(i)).unwrap_or(&NULL)
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(f) => Some(f.to_string()),
        Value::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
        Value::Null => None,
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Real(f) => Some(*f as i64),
        Value::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Integer(i) => datetime_from_epoch(*i),
        Value::Real(f) => datetime_from_epoch(*f as i64),
        Value::Text(s) => parse_datetime(s),
        _ => None,
    }
}

fn key(value: &Value) -> Option<String> {
    text(value)
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
}

fn tags(value: &Value) -> Vec<String> {
    text(value)
        .map(|s| split_tags(&s.replace([',', '、'], " ")))
        .unwrap_or_default()
}

/// The source time, or now for a first insert.
fn timestamp_or_now(value: &Value) -> (DateTime<Utc>, bool) {
    match timestamp(value) {
        Some(at) => (at, true),
        None => (Utc::now(), false),
    }
}

fn novel_from_values(row: &[Value]) -> Option<Imported<Novel>> {
    let spec = &NOVELS;
    let Some(ncode) = key(field(spec, row, "ncode")) else {
        tracing::debug!("Skipping novel row without ncode");
        return None;
    };
    let (last_update, timestamp_known) = timestamp_or_now(field(spec, row, "general_lastup"));
    let record = Novel {
        ncode,
        title: text(field(spec, row, "title")).unwrap_or_default(),
        author: text(field(spec, row, "author")).unwrap_or_default(),
        synopsis: text(field(spec, row, "synopsis")).unwrap_or_default(),
        main_tags: tags(field(spec, row, "main_tags")),
        sub_tags: tags(field(spec, row, "sub_tags")),
        rating: integer(field(spec, row, "rating")).unwrap_or(0),
        total_episodes: integer(field(spec, row, "total_ep")).unwrap_or(0),
        last_update,
        last_read_episode: 0,
    };
    Some(Imported {
        record,
        timestamp_known,
    })
}

fn episode_from_values(row: &[Value]) -> Option<Imported<Episode>> {
    let spec = &EPISODES;
    let ncode = key(field(spec, row, "ncode"));
    let episode_no = text(field(spec, row, "episode_no"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let (Some(ncode), Some(episode_no)) = (ncode, episode_no) else {
        tracing::debug!("Skipping episode row without ncode or number");
        return None;
    };
    let (updated_at, timestamp_known) = timestamp_or_now(field(spec, row, "update_time"));
    Some(Imported {
        record: Episode {
            ncode,
            episode_no,
            title: text(field(spec, row, "e_title")).unwrap_or_default(),
            body: text(field(spec, row, "body")).unwrap_or_default(),
            updated_at,
        },
        timestamp_known,
    })
}

fn last_read_from_values(row: &[Value]) -> Option<Imported<LastRead>> {
    let spec = &LAST_READ;
    let Some(ncode) = key(field(spec, row, "ncode")) else {
        tracing::debug!("Skipping reading position without ncode");
        return None;
    };
    let (date, timestamp_known) = timestamp_or_now(field(spec, row, "date"));
    Some(Imported {
        record: LastRead {
            ncode,
            date,
            episode_no: integer(field(spec, row, "episode_no")).unwrap_or(0),
        },
        timestamp_known,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{EPISODES_TABLE, LAST_READ_TABLE, NOVELS_TABLE};
    use crate::import::http_client;
    use tempfile::tempdir;

    /// An external database in the shape an older producer writes:
    /// capitalized columns, no rating, integer millisecond timestamps.
    fn write_external(path: &Path, last_read_table: &str, with_episodes: bool) {
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE novels_descs (
                Ncode TEXT PRIMARY KEY, Title TEXT, Author TEXT, Synopsis TEXT,
                main_tag TEXT, sub_tag TEXT, total_ep INTEGER, general_lastup INTEGER
            );
            INSERT INTO novels_descs VALUES
                ('N0001AA', 'First', 'A', 'story one', 'fantasy', 'magic,school', 12, 1714564800000),
                ('n0002bb', 'Second', NULL, NULL, NULL, NULL, 3, NULL),
                (NULL, 'Broken', NULL, NULL, NULL, NULL, 0, NULL);
            "#,
        )
        .unwrap();
        if with_episodes {
            conn.execute_batch(
                r#"
                CREATE TABLE episodes (ncode TEXT, episodeNo TEXT, e_title TEXT, body TEXT, update_time TEXT);
                INSERT INTO episodes VALUES
                    ('n0001aa', '1', 'Ep 1', '｜漢字《かんじ》', '2024-05-01 12:00:00'),
                    ('n0001aa', '2', 'Ep 2', 'two', NULL),
                    ('n0001aa', '10', 'Ep 10', 'ten', '2024-05-03T00:00:00+00:00');
                "#,
            )
            .unwrap();
            for i in 0..45 {
                conn.execute(
                    "INSERT INTO episodes VALUES ('n0002bb', ?1, 'x', 'body', NULL)",
                    [format!("{}", i + 1)],
                )
                .unwrap();
            }
        }
        conn.execute_batch(&format!(
            "CREATE TABLE {last_read_table} (ncode TEXT, date INTEGER, episode_no INTEGER);
             INSERT INTO {last_read_table} VALUES ('n0001aa', 1714564800, 2), ('n0002bb', NULL, 1);"
        ))
        .unwrap();
    }

    async fn setup() -> (Repository, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::new(dir.path().join("novels.db")).await.unwrap();
        (repo, dir)
    }

    async fn counts(repo: &Repository) -> (i64, i64, i64) {
        (
            repo.count_rows(NOVELS_TABLE).await.unwrap(),
            repo.count_rows(EPISODES_TABLE).await.unwrap(),
            repo.count_rows(LAST_READ_TABLE).await.unwrap(),
        )
    }

    async fn stored_state(repo: &Repository) -> (Vec<Novel>, Vec<Episode>, Vec<Option<LastRead>>) {
        let novels = repo.get_all_novels().await.unwrap();
        let mut episodes = repo.get_episodes("n0001aa").await.unwrap();
        episodes.extend(repo.get_episodes("n0002bb").await.unwrap());
        let bookmarks = vec![
            repo.get_last_read("n0001aa").await.unwrap(),
            repo.get_last_read("n0002bb").await.unwrap(),
        ];
        (novels, episodes, bookmarks)
    }

    #[tokio::test]
    async fn merges_all_tables_with_defaults() {
        let (repo, dir) = setup().await;
        let external = dir.path().join("external.db");
        write_external(&external, "last_read_novel", true);

        let (reporter, rx) = ProgressReporter::new();
        let report = merge_external_database(
            &repo,
            &ImportSource::Local(external),
            &http_client().unwrap(),
            MergeOptions::default(),
            &reporter,
        )
        .await
        .unwrap();

        assert_eq!(report.novels, 2);
        assert_eq!(report.episodes, 48);
        assert_eq!(report.last_reads, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(rx.borrow().fraction, Some(1.0));

        let first = repo.get_novel("n0001aa").await.unwrap().unwrap();
        assert_eq!(first.synopsis, "story one");
        assert_eq!(first.sub_tags, vec!["magic", "school"]);
        assert_eq!(first.rating, 0);
        assert_eq!(first.last_read_episode, 2);
        assert_eq!(first.unread_count(), 10);
        assert_eq!(first.last_update.timestamp(), 1_714_564_800);

        let second = repo.get_novel("n0002bb").await.unwrap().unwrap();
        assert_eq!(second.author, "");
        assert!((Utc::now() - second.last_update).num_minutes() < 5);

        let numbers: Vec<String> = repo
            .get_episodes("n0001aa")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.episode_no)
            .collect();
        assert_eq!(numbers, vec!["1", "2", "10"]);
    }

    #[tokio::test]
    async fn rerunning_an_unchanged_source_changes_nothing() {
        let (repo, dir) = setup().await;
        let external = dir.path().join("external.db");
        write_external(&external, "last_read_novel", true);
        let source = ImportSource::Local(external);
        let client = http_client().unwrap();

        let (reporter, _rx) = ProgressReporter::new();
        merge_external_database(&repo, &source, &client, MergeOptions::default(), &reporter)
            .await
            .unwrap();
        let first_counts = counts(&repo).await;
        let first = stored_state(&repo).await;

        let (reporter, _rx) = ProgressReporter::new();
        let options = MergeOptions {
            snapshot: true,
            ..Default::default()
        };
        merge_external_database(&repo, &source, &client, options, &reporter)
            .await
            .unwrap();

        assert_eq!(counts(&repo).await, first_counts);
        // Rows whose source timestamp is NULL included.
        assert_eq!(stored_state(&repo).await, first);
    }

    #[tokio::test]
    async fn undated_bookmark_does_not_replace_a_stored_one() {
        let (repo, dir) = setup().await;
        let stored = LastRead {
            ncode: "n0002bb".to_string(),
            date: Utc::now() - chrono::Duration::days(30),
            episode_no: 7,
        };
        repo.upsert_last_read(stored.clone()).await.unwrap();
        let external = dir.path().join("external.db");
        write_external(&external, "last_read_novel", true);

        let (reporter, _rx) = ProgressReporter::new();
        merge_external_database(
            &repo,
            &ImportSource::Local(external),
            &http_client().unwrap(),
            MergeOptions::default(),
            &reporter,
        )
        .await
        .unwrap();

        let kept = repo.get_last_read("n0002bb").await.unwrap().unwrap();
        assert_eq!(kept.episode_no, 7);
        assert_eq!(kept.date.timestamp(), stored.date.timestamp());
    }

    #[tokio::test]
    async fn missing_table_aborts_before_any_write() {
        let (repo, dir) = setup().await;
        let external = dir.path().join("external.db");
        write_external(&external, "last_read_novel", false);

        let (reporter, _rx) = ProgressReporter::new();
        let err = merge_external_database(
            &repo,
            &ImportSource::Local(external),
            &http_client().unwrap(),
            MergeOptions::default(),
            &reporter,
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("episodes"));
        match err {
            AppError::IncompatibleSchema { missing } => assert_eq!(missing, vec!["episodes"]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(counts(&repo).await, (0, 0, 0));
    }

    #[tokio::test]
    async fn legacy_bookmark_table_name_is_accepted() {
        let (repo, dir) = setup().await;
        let external = dir.path().join("external.db");
        write_external(&external, "rast_read_novel", true);

        let (reporter, _rx) = ProgressReporter::new();
        let report = merge_external_database(
            &repo,
            &ImportSource::Local(external),
            &http_client().unwrap(),
            MergeOptions::default(),
            &reporter,
        )
        .await
        .unwrap();
        assert_eq!(report.last_reads, 2);
    }

    #[tokio::test]
    async fn progress_passes_every_phase_checkpoint() {
        let (repo, dir) = setup().await;
        let external = dir.path().join("external.db");
        write_external(&external, "last_read_novel", true);

        let (tx, mut trail) = tokio::sync::mpsc::unbounded_channel();
        let (reporter, _rx) = ProgressReporter::new();
        let reporter = reporter.with_listener(tx);
        merge_external_database(
            &repo,
            &ImportSource::Local(external),
            &http_client().unwrap(),
            MergeOptions::default(),
            &reporter,
        )
        .await
        .unwrap();

        let mut fractions = Vec::new();
        while let Ok(progress) = trail.try_recv() {
            fractions.push(progress.fraction.unwrap());
        }
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]), "{fractions:?}");
        let mut from = 0;
        for checkpoint in [0.1f32, 0.2, 0.3, 0.6, 0.9, 1.0] {
            let at = fractions[from..]
                .iter()
                .position(|f| (*f - checkpoint).abs() < 1e-6)
                .unwrap_or_else(|| panic!("{checkpoint} missing from {fractions:?}"));
            from += at;
        }
        assert_eq!(fractions.last(), Some(&1.0));
    }

    #[test]
    fn phase_fraction_interpolates_within_bounds() {
        assert_eq!(phase_fraction(0.3, 0.6, 0, 10), 0.3);
        assert!((phase_fraction(0.3, 0.6, 5, 10) - 0.45).abs() < 1e-6);
        assert_eq!(phase_fraction(0.3, 0.6, 12, 10), 0.6);
        assert_eq!(phase_fraction(0.9, 1.0, 0, 0), 1.0);
    }
}
