use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::catalog::{CatalogCache, CatalogEntry};
use crate::config::Config;
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::import::copy::copy_database;
use crate::import::merge::{merge_external_database, MergeOptions};
use crate::import::{
    http_client, CopyProgress, ImportGuard, ImportSource, ProgressReporter, SyncProgress, SyncReport,
    PROGRESS_POLL_INTERVAL,
};
use crate::models::{Episode, Novel, UpdateQueueEntry};
use crate::preferences::{PreferenceStore, Preferences};
use crate::ruby::{self, AnnotatedText};
use crate::services::{diff_updates, NarouClient, RemoteStatus};
use crate::tui::AppAction;

const STATUS_TTL: Duration = Duration::from_secs(4);
const MIN_FONT_SIZE: f32 = 8.0;
const MAX_FONT_SIZE: f32 = 48.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Library,
    Episodes,
    Reader,
    Catalog,
    UpdateQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// Upsert the external rows into the working database.
    Merge,
    /// Replace the working database file with the external one.
    Copy,
}

#[derive(Debug)]
pub enum ImportOutcome {
    Merged(SyncReport),
    Copied(u64),
}

enum ProgressSource {
    Merge(watch::Receiver<SyncProgress>),
    Copy(Arc<CopyProgress>),
}

struct RunningImport {
    kind: ImportKind,
    handle: JoinHandle<Result<ImportOutcome>>,
    progress: ProgressSource,
    /// Every merge report, for the debug log.
    trail: Option<mpsc::UnboundedReceiver<SyncProgress>>,
    last_poll: Option<Instant>,
}

pub struct ReaderState {
    pub ncode: String,
    pub episode_no: i64,
    pub title: String,
    body: String,
    pub text: AnnotatedText,
    pub scroll: u16,
}

pub struct App {
    // Data
    pub novels: Vec<Novel>,
    pub episodes: Vec<Episode>,
    pub catalog: Vec<CatalogEntry>,
    pub update_queue: Vec<UpdateQueueEntry>,
    pub reader: Option<ReaderState>,

    // UI State
    pub view: View,
    pub selected_index: usize,
    pub episode_index: usize,
    pub show_help: bool,
    pub import_input_active: bool,
    pub import_input: String,
    status: Option<(String, Instant)>,

    // Async state
    pub progress: Option<SyncProgress>,
    running_import: Option<RunningImport>,
    import_guard: ImportGuard,
    prefs_rx: watch::Receiver<Preferences>,
    pub checking_updates: bool,
    update_tx: mpsc::Sender<Vec<RemoteStatus>>,
    update_rx: mpsc::Receiver<Vec<RemoteStatus>>,

    // Services
    pub repository: Repository,
    pub prefs: PreferenceStore,
    config: Config,
    catalog_cache: CatalogCache,
    http: Client,
}

impl App {
    pub async fn new(config: &Config) -> Result<Self> {
        let repository = Repository::new(&config.db_path).await?;
        let prefs = PreferenceStore::load(&config.prefs_path)?;
        let prefs_rx = prefs.subscribe();

        let novels = repository.get_all_novels().await?;
        let update_queue = repository.get_update_queue().await?;
        let (update_tx, update_rx) = mpsc::channel(1);

        Ok(Self {
            novels,
            episodes: Vec::new(),
            catalog: Vec::new(),
            update_queue,
            reader: None,
            view: View::Library,
            selected_index: 0,
            episode_index: 0,
            show_help: false,
            import_input_active: false,
            import_input: String::new(),
            status: None,
            progress: None,
            running_import: None,
            import_guard: ImportGuard::new(),
            prefs_rx,
            checking_updates: false,
            update_tx,
            update_rx,
            repository,
            prefs,
            config: config.clone(),
            catalog_cache: CatalogCache::new(),
            http: http_client()?,
        })
    }

    pub fn selected_novel(&self) -> Option<&Novel> {
        self.novels.get(self.selected_index)
    }

    pub fn selected_episode(&self) -> Option<&Episode> {
        self.episodes.get(self.episode_index)
    }

    pub fn is_in_library(&self, ncode: &str) -> bool {
        self.novels.iter().any(|n| n.ncode == ncode)
    }

    pub fn is_importing(&self) -> bool {
        self.running_import.is_some()
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status
            .as_ref()
            .filter(|(_, at)| at.elapsed() < STATUS_TTL)
            .map(|(msg, _)| msg.as_str())
    }

    fn set_status(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.status = Some((message, Instant::now()));
    }

    fn list_len(&self) -> usize {
        match self.view {
            View::Library => self.novels.len(),
            View::Episodes => self.episodes.len(),
            View::Catalog => self.catalog.len(),
            View::UpdateQueue => self.update_queue.len(),
            View::Reader => 0,
        }
    }

    fn cursor(&mut self) -> &mut usize {
        match self.view {
            View::Episodes => &mut self.episode_index,
            _ => &mut self.selected_index,
        }
    }

    pub async fn handle_action(&mut self, action: AppAction) -> Result<bool> {
        match action {
            AppAction::Quit => {
                self.cancel_import().await;
                return Ok(true);
            }

            AppAction::MoveUp => {
                if self.view == View::Reader {
                    if let Some(reader) = &mut self.reader {
                        reader.scroll = reader.scroll.saturating_sub(1);
                    }
                } else {
                    let cursor = self.cursor();
                    *cursor = cursor.saturating_sub(1);
                }
            }

            AppAction::MoveDown => {
                if self.view == View::Reader {
                    if let Some(reader) = &mut self.reader {
                        reader.scroll = reader.scroll.saturating_add(1);
                    }
                } else {
                    let len = self.list_len();
                    let cursor = self.cursor();
                    if len > 0 && *cursor < len - 1 {
                        *cursor += 1;
                    }
                }
            }

            AppAction::Select => match self.view {
                View::Library => self.open_selected_novel().await?,
                View::Episodes => {
                    if let Some(episode) = self.selected_episode() {
                        let (ncode, no) = (episode.ncode.clone(), episode.number());
                        self.open_episode(&ncode, no).await?;
                    }
                }
                View::UpdateQueue => {
                    if let Some(entry) = self.update_queue.get(self.selected_index) {
                        let ncode = entry.ncode.clone();
                        if let Some(index) = self.novels.iter().position(|n| n.ncode == ncode) {
                            self.selected_index = index;
                            self.open_selected_novel().await?;
                        }
                    }
                }
                View::Catalog | View::Reader => {}
            },

            AppAction::Back => match self.view {
                View::Reader => {
                    self.view = View::Episodes;
                    self.reload_episodes().await?;
                }
                View::Episodes | View::Catalog | View::UpdateQueue => {
                    self.view = View::Library;
                    self.selected_index = 0;
                    self.reload_novels().await?;
                }
                View::Library => {}
            },

            AppAction::NextEpisode => self.step_episode(1).await?,
            AppAction::PrevEpisode => self.step_episode(-1).await?,

            AppAction::ShowCatalog => {
                // Pressed again on the catalog: re-read the snapshot.
                if self.view == View::Catalog {
                    self.catalog_cache.invalidate();
                }
                self.load_catalog().await?
            }

            AppAction::ShowUpdateQueue => {
                self.update_queue = self.repository.get_update_queue().await?;
                self.view = View::UpdateQueue;
                self.selected_index = 0;
            }

            AppAction::CheckUpdates => self.start_update_check()?,

            AppAction::RemoveEntry => self.remove_selected().await?,

            AppAction::OpenInBrowser => {
                let url = match self.view {
                    View::Catalog => self.catalog.get(self.selected_index).map(|e| {
                        format!("{}/{}/", self.config.novel_base_url.trim_end_matches('/'), e.ncode)
                    }),
                    _ => self
                        .selected_novel()
                        .map(|n| n.page_url(&self.config.novel_base_url)),
                };
                if let Some(url) = url {
                    if let Err(e) = open::that(&url) {
                        tracing::warn!("Failed to open {}: {}", url, e);
                    }
                }
            }

            AppAction::FontLarger => self.change_font_size(2.0)?,
            AppAction::FontSmaller => self.change_font_size(-2.0)?,

            AppAction::ToggleCopyMode => {
                let prefs = self.prefs.update(|p| p.copy_mode = !p.copy_mode)?;
                let mode = if prefs.copy_mode { "whole-file copy" } else { "row merge" };
                self.set_status(format!("Import mode: {mode}"));
            }

            AppAction::ImportStart => {
                if self.is_importing() {
                    self.set_status(AppError::ImportInProgress.to_string());
                } else {
                    self.import_input_active = true;
                    self.import_input = self.prefs.current().external_db_uri;
                }
            }

            AppAction::ImportInputChar(c) => self.import_input.push(c),

            AppAction::ImportInputBackspace => {
                self.import_input.pop();
            }

            AppAction::ImportInputConfirm => {
                self.import_input_active = false;
                let source = std::mem::take(&mut self.import_input);
                let kind = if self.prefs.current().copy_mode {
                    ImportKind::Copy
                } else {
                    ImportKind::Merge
                };
                if let Err(e) = self.start_import(&source, kind) {
                    self.set_status(format!("Import failed: {e}"));
                }
            }

            AppAction::ImportInputCancel => {
                self.import_input_active = false;
                self.import_input.clear();
            }

            AppAction::CancelImport => {
                if self.cancel_import().await {
                    self.set_status("Import cancelled");
                }
            }

            AppAction::ShowHelp => self.show_help = true,
            AppAction::HideHelp => self.show_help = false,
        }

        Ok(false)
    }

    async fn reload_novels(&mut self) -> Result<()> {
        self.novels = self.repository.get_all_novels().await?;
        if self.selected_index >= self.novels.len() {
            self.selected_index = self.novels.len().saturating_sub(1);
        }
        Ok(())
    }

    async fn reload_episodes(&mut self) -> Result<()> {
        if let Some(ncode) = self.selected_novel().map(|n| n.ncode.clone()) {
            self.novels = self.repository.get_all_novels().await?;
            self.episodes = self.repository.get_episodes(&ncode).await?;
        }
        Ok(())
    }

    async fn open_selected_novel(&mut self) -> Result<()> {
        let Some(novel) = self.selected_novel() else {
            return Ok(());
        };
        let (ncode, last_read) = (novel.ncode.clone(), novel.last_read_episode);
        self.episodes = self.repository.get_episodes(&ncode).await?;
        // Start on the bookmarked episode.
        self.episode_index = self
            .episodes
            .iter()
            .position(|e| e.number() == last_read)
            .unwrap_or(0);
        self.view = View::Episodes;
        Ok(())
    }

    pub async fn open_episode(&mut self, ncode: &str, episode_no: i64) -> Result<()> {
        let Some(episode) = self.repository.get_episode(ncode, episode_no).await? else {
            self.set_status(format!("Episode {episode_no} of {ncode} is not stored locally"));
            return Ok(());
        };
        self.repository.mark_episode_read(ncode, episode_no).await?;

        let (base, ruby_size) = self.prefs.current().font_sizes();
        self.reader = Some(ReaderState {
            ncode: ncode.to_string(),
            episode_no,
            title: episode.title.clone(),
            text: ruby::render_body(&episode.body, base, ruby_size),
            body: episode.body,
            scroll: 0,
        });
        self.view = View::Reader;
        Ok(())
    }

    async fn step_episode(&mut self, delta: i64) -> Result<()> {
        let Some(reader) = &self.reader else {
            return Ok(());
        };
        if self.view != View::Reader {
            return Ok(());
        }
        let (ncode, next) = (reader.ncode.clone(), reader.episode_no + delta);
        if next < 1 {
            return Ok(());
        }
        self.open_episode(&ncode, next).await?;
        if let Some(index) = self.episodes.iter().position(|e| e.number() == next) {
            self.episode_index = index;
        }
        Ok(())
    }

    fn change_font_size(&mut self, delta: f32) -> Result<()> {
        let prefs = self
            .prefs
            .update(|p| p.font_size = (p.font_size + delta).clamp(MIN_FONT_SIZE, MAX_FONT_SIZE))?;
        self.set_status(format!("Font size {}", prefs.font_size));
        Ok(())
    }

    /// Re-render the open episode when the preferences changed.
    pub fn poll_preferences(&mut self) {
        if !self.prefs_rx.has_changed().unwrap_or(false) {
            return;
        }
        let prefs = self.prefs_rx.borrow_and_update().clone();
        if let Some(reader) = &mut self.reader {
            let (base, ruby_size) = prefs.font_sizes();
            reader.text = ruby::render_body(&reader.body, base, ruby_size);
        }
    }

    async fn load_catalog(&mut self) -> Result<()> {
        let prefs = self.prefs.current();
        let Some(source) = prefs.catalog_source(self.config.catalog_path.as_deref()) else {
            self.set_status("No catalog snapshot configured");
            return Ok(());
        };
        match self.catalog_cache.load(&source).await {
            Ok(entries) => {
                self.catalog = entries.as_ref().clone();
                self.view = View::Catalog;
                self.selected_index = 0;
            }
            Err(e) => self.set_status(format!("Catalog: {e}")),
        }
        Ok(())
    }

    async fn remove_selected(&mut self) -> Result<()> {
        match self.view {
            View::UpdateQueue => {
                if let Some(entry) = self.update_queue.get(self.selected_index) {
                    let ncode = entry.ncode.clone();
                    self.repository.remove_from_update_queue(&ncode).await?;
                    self.update_queue = self.repository.get_update_queue().await?;
                    if self.selected_index >= self.update_queue.len() {
                        self.selected_index = self.update_queue.len().saturating_sub(1);
                    }
                }
            }
            View::Library => {
                if let Some(novel) = self.selected_novel() {
                    let ncode = novel.ncode.clone();
                    self.repository.delete_last_read(&ncode).await?;
                    self.reload_novels().await?;
                    self.set_status(format!("Cleared reading position of {ncode}"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Queue novels whose remote episode count grew. Returns how many.
    pub async fn check_updates(&mut self) -> Result<usize> {
        let client = NarouClient::new(self.config.narou_api_url.clone())?;
        let ncodes = self.novels.iter().map(|n| n.ncode.clone()).collect();
        let statuses = client.fetch_all_statuses(ncodes).await;
        self.queue_updates(&statuses).await
    }

    /// Run the status queries in the background; see [`App::poll_update_check`].
    fn start_update_check(&mut self) -> Result<()> {
        if self.checking_updates {
            self.set_status("Update check already running");
            return Ok(());
        }
        let client = NarouClient::new(self.config.narou_api_url.clone())?;
        let ncodes: Vec<String> = self.novels.iter().map(|n| n.ncode.clone()).collect();
        let tx = self.update_tx.clone();

        self.checking_updates = true;
        self.set_status(format!("Checking {} novels for updates", ncodes.len()));
        tokio::spawn(async move {
            let statuses = client.fetch_all_statuses(ncodes).await;
            let _ = tx.send(statuses).await;
        });
        Ok(())
    }

    /// Collect a finished update check (non-blocking). Returns how many
    /// novels were queued.
    pub async fn poll_update_check(&mut self) -> Result<Option<usize>> {
        let Ok(statuses) = self.update_rx.try_recv() else {
            return Ok(None);
        };
        self.checking_updates = false;
        let queued = self.queue_updates(&statuses).await?;
        self.set_status(format!("{queued} novels have new episodes"));
        Ok(Some(queued))
    }

    async fn queue_updates(&mut self, statuses: &[RemoteStatus]) -> Result<usize> {
        let entries = diff_updates(&self.novels, statuses, Utc::now());
        let queued = self.repository.enqueue_updates(entries).await?;
        self.update_queue = self.repository.get_update_queue().await?;
        Ok(queued)
    }

    // Import

    pub fn start_import(&mut self, source: &str, kind: ImportKind) -> Result<()> {
        let permit = self.import_guard.try_acquire()?;
        let source_ref = ImportSource::parse(source)?;
        self.prefs.update(|p| {
            p.external_db_uri = source.trim().to_string();
            p.external_db_enabled = true;
        })?;

        let client = self.http.clone();
        let (handle, progress, trail) = match kind {
            ImportKind::Merge => {
                let repo = self.repository.clone();
                let options = MergeOptions {
                    snapshot: self.config.import_snapshot,
                    scratch_dir: Some(self.scratch_dir()),
                };
                let (trail_tx, trail) = mpsc::unbounded_channel();
                let (reporter, rx) = ProgressReporter::new();
                let reporter = reporter.with_listener(trail_tx);
                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    merge_external_database(&repo, &source_ref, &client, options, &reporter)
                        .await
                        .map(ImportOutcome::Merged)
                });
                (handle, ProgressSource::Merge(rx), Some(trail))
            }
            ImportKind::Copy => {
                let counters = Arc::new(CopyProgress::default());
                let shared = Arc::clone(&counters);
                let db_path = PathBuf::from(&self.config.db_path);
                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    copy_database(&source_ref, &client, &db_path, &shared)
                        .await
                        .map(ImportOutcome::Copied)
                });
                (handle, ProgressSource::Copy(counters), None)
            }
        };

        self.progress = Some(SyncProgress::default());
        self.running_import = Some(RunningImport {
            kind,
            handle,
            progress,
            trail,
            last_poll: None,
        });
        Ok(())
    }

    /// Temporary import files live beside the working database.
    fn scratch_dir(&self) -> PathBuf {
        Path::new(&self.config.db_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }

    /// Abort the running import and wait for the task to wind down, so its
    /// temporary files and the import permit are gone when this returns.
    pub async fn cancel_import(&mut self) -> bool {
        let Some(running) = self.running_import.take() else {
            return false;
        };
        self.progress = None;
        running.handle.abort();
        match running.handle.await {
            Err(e) if e.is_cancelled() => tracing::info!("Import cancelled"),
            Err(e) => tracing::warn!("Import task failed while cancelling: {}", e),
            Ok(Err(e)) => tracing::info!("Import had already failed: {}", e),
            Ok(Ok(_)) => {
                // Finished before the abort landed.
                if let Err(e) = self.refresh_after_import(running.kind).await {
                    tracing::error!("Reloading after import failed: {}", e);
                }
            }
        }
        true
    }

    async fn refresh_after_import(&mut self, kind: ImportKind) -> Result<()> {
        if kind == ImportKind::Copy {
            // The file under the old connection was replaced.
            self.repository = Repository::new(&self.config.db_path).await?;
        }
        self.reload_novels().await?;
        self.update_queue = self.repository.get_update_queue().await?;
        Ok(())
    }

    /// Sample progress at most every [`PROGRESS_POLL_INTERVAL`] and collect
    /// the result once the task has finished.
    pub async fn poll_import(&mut self) -> Option<std::result::Result<ImportOutcome, String>> {
        let Some(running) = &mut self.running_import else {
            return None;
        };
        if let Some(trail) = &mut running.trail {
            while let Ok(step) = trail.try_recv() {
                tracing::debug!("Import progress {:?}: {}", step.fraction, step.message);
            }
        }

        let due = running
            .last_poll
            .map_or(true, |at| at.elapsed() >= PROGRESS_POLL_INTERVAL);
        if due {
            running.last_poll = Some(Instant::now());
            self.progress = Some(match &running.progress {
                ProgressSource::Merge(rx) => rx.borrow().clone(),
                ProgressSource::Copy(counters) => counters.snapshot(),
            });
        }

        if !running.handle.is_finished() {
            return None;
        }
        let running = self.running_import.take()?;
        self.progress = None;

        let outcome = match running.handle.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                let message = e.to_string();
                tracing::error!("Import failed: {}", message);
                self.set_status(format!("Import failed: {message}"));
                return Some(Err(message));
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!("Import task failed: {}", message);
                self.set_status(format!("Import failed: {message}"));
                return Some(Err(message));
            }
        };

        if let Err(e) = self.refresh_after_import(running.kind).await {
            let message = format!("could not reload the database: {e}");
            tracing::error!("Import finished but {}", message);
            self.set_status(format!("Import failed: {message}"));
            return Some(Err(message));
        }

        match &outcome {
            ImportOutcome::Merged(report) => self.set_status(format!(
                "Imported {} novels, {} episodes, {} reading positions",
                report.novels, report.episodes, report.last_reads
            )),
            ImportOutcome::Copied(bytes) => {
                self.set_status(format!("Database replaced ({} KiB)", bytes / 1024))
            }
        }
        Some(Ok(outcome))
    }

    /// Run an import to completion, printing progress as it is sampled.
    pub async fn import_blocking(&mut self, source: &str, kind: ImportKind) -> Result<ImportOutcome> {
        self.start_import(source, kind)?;
        let mut ticker = tokio::time::interval(PROGRESS_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if let Some(result) = self.poll_import().await {
                return result.map_err(|e| anyhow::anyhow!(e).into());
            }
            if let Some(progress) = &self.progress {
                match progress.fraction {
                    Some(f) => eprintln!("{:>3.0}% {}", f * 100.0, progress.message),
                    None => eprintln!("  … {}", progress.message),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::NOVELS_TABLE;
    use crate::import::SNAPSHOT_PREFIX;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            db_path: dir.join("novels.db").to_string_lossy().to_string(),
            prefs_path: dir.join("prefs.toml").to_string_lossy().to_string(),
            narou_api_url: "http://127.0.0.1:9/".to_string(),
            novel_base_url: "https://ncode.syosetu.com".to_string(),
            catalog_path: None,
            import_snapshot: true,
        }
    }

    fn write_external(path: &std::path::Path) {
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE novels_descs (ncode TEXT PRIMARY KEY, title TEXT, total_ep INTEGER);
            INSERT INTO novels_descs VALUES ('n0001aa', 'First', 2);
            CREATE TABLE episodes (ncode TEXT, episode_no TEXT, e_title TEXT, body TEXT);
            INSERT INTO episodes VALUES ('n0001aa', '1', 'One', '｜漢字《かんじ》'), ('n0001aa', '2', 'Two', 'x');
            CREATE TABLE last_read_novel (ncode TEXT, date TEXT, episode_no INTEGER);
            "#,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn merge_import_then_read_episode() {
        let dir = tempdir().unwrap();
        let external = dir.path().join("external.db");
        write_external(&external);
        let mut app = App::new(&test_config(dir.path())).await.unwrap();

        let outcome = app
            .import_blocking(&external.to_string_lossy(), ImportKind::Merge)
            .await
            .unwrap();
        assert!(matches!(outcome, ImportOutcome::Merged(SyncReport { novels: 1, episodes: 2, .. })));
        assert_eq!(app.novels.len(), 1);
        assert_eq!(app.prefs.current().external_db_uri, external.to_string_lossy());

        app.handle_action(AppAction::Select).await.unwrap();
        assert_eq!(app.view, View::Episodes);
        app.handle_action(AppAction::Select).await.unwrap();
        assert_eq!(app.view, View::Reader);
        let reader = app.reader.as_ref().unwrap();
        assert_eq!(reader.text.ruby_pairs(), vec![("漢字", "かんじ")]);

        app.handle_action(AppAction::NextEpisode).await.unwrap();
        assert_eq!(app.reader.as_ref().unwrap().episode_no, 2);
        app.handle_action(AppAction::Back).await.unwrap();
        app.handle_action(AppAction::Back).await.unwrap();
        assert_eq!(app.novels[0].last_read_episode, 2);
        assert_eq!(app.novels[0].unread_count(), 0);
    }

    #[tokio::test]
    async fn copy_import_replaces_working_database() {
        let dir = tempdir().unwrap();
        let external = dir.path().join("external.db");
        let source = Repository::new(&external).await.unwrap();
        source
            .upsert_novels(vec![Novel {
                ncode: "n0001aa".into(),
                title: "First".into(),
                author: "someone".into(),
                synopsis: String::new(),
                main_tags: vec![],
                sub_tags: vec![],
                rating: 0,
                total_episodes: 2,
                last_update: Utc::now(),
                last_read_episode: 0,
            }])
            .await
            .unwrap();
        source.close().await.unwrap();
        let mut app = App::new(&test_config(dir.path())).await.unwrap();
        assert!(app.novels.is_empty());

        let outcome = app
            .import_blocking(&external.to_string_lossy(), ImportKind::Copy)
            .await
            .unwrap();
        assert!(matches!(outcome, ImportOutcome::Copied(bytes) if bytes > 0));
        assert_eq!(app.repository.count_rows(NOVELS_TABLE).await.unwrap(), 1);
        assert_eq!(app.novels[0].title, "First");
    }

    #[tokio::test]
    async fn second_import_is_rejected_while_running() {
        let dir = tempdir().unwrap();
        let external = dir.path().join("external.db");
        write_external(&external);
        let mut app = App::new(&test_config(dir.path())).await.unwrap();

        app.start_import(&external.to_string_lossy(), ImportKind::Merge).unwrap();
        let second = app.start_import(&external.to_string_lossy(), ImportKind::Copy);
        assert!(matches!(second, Err(AppError::ImportInProgress)));

        assert!(app.cancel_import().await);
        assert!(!app.is_importing());
        // A cancelled import frees the guard by the time cancel returns.
        app.start_import(&external.to_string_lossy(), ImportKind::Merge).unwrap();
        assert!(app.cancel_import().await);
        assert!(!app.cancel_import().await);
    }

    /// Sends the headers and the first bytes of a large body, then stalls.
    async fn stalled_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = [0u8; 4096];
                    let _ = socket.read(&mut request).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10000000\r\n\r\n")
                        .await;
                    let _ = socket.write_all(&[0u8; 4096]).await;
                    tokio::time::sleep(Duration::from_secs(120)).await;
                });
            }
        });
        format!("http://{addr}/external.db")
    }

    fn temp_files(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(SNAPSHOT_PREFIX) || name.starts_with(".nr-reader-copy-"))
            .collect()
    }

    #[tokio::test]
    async fn abort_releases_temp_copy_and_guard() {
        let dir = tempdir().unwrap();
        let external = dir.path().join("external.db");
        write_external(&external);
        let mut app = App::new(&test_config(dir.path())).await.unwrap();
        app.import_blocking(&external.to_string_lossy(), ImportKind::Merge)
            .await
            .unwrap();
        let url = stalled_server().await;

        for kind in [ImportKind::Merge, ImportKind::Copy] {
            app.start_import(&url, kind).unwrap();
            tokio::time::timeout(Duration::from_secs(10), async {
                while temp_files(dir.path()).is_empty() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .unwrap();
            assert!(app.poll_import().await.is_none());

            assert!(app.cancel_import().await);
            assert!(temp_files(dir.path()).is_empty(), "{kind:?} left a temporary file");
            drop(app.import_guard.try_acquire().unwrap());
        }

        // The working database was never touched.
        assert_eq!(app.repository.count_rows(NOVELS_TABLE).await.unwrap(), 1);
        assert!(App::new(&test_config(dir.path())).await.is_ok());
    }

    #[tokio::test]
    async fn copy_of_a_non_database_keeps_the_library() {
        let dir = tempdir().unwrap();
        let external = dir.path().join("external.db");
        write_external(&external);
        let mut app = App::new(&test_config(dir.path())).await.unwrap();
        app.import_blocking(&external.to_string_lossy(), ImportKind::Merge)
            .await
            .unwrap();
        let notes = dir.path().join("notes.txt");
        std::fs::write(&notes, "not a database, just some text\n").unwrap();

        let result = app.import_blocking(&notes.to_string_lossy(), ImportKind::Copy).await;

        assert!(result.is_err());
        assert!(!app.is_importing());
        assert!(app.status_message().unwrap().starts_with("Import failed"));
        assert_eq!(app.novels.len(), 1);
        let reopened = App::new(&test_config(dir.path())).await.unwrap();
        assert_eq!(reopened.novels[0].ncode, "n0001aa");
    }

    #[tokio::test]
    async fn update_check_does_not_block_the_ui() {
        let dir = tempdir().unwrap();
        let external = dir.path().join("external.db");
        write_external(&external);
        let mut config = test_config(dir.path());
        config.narou_api_url = stalled_server().await;
        let mut app = App::new(&config).await.unwrap();
        app.import_blocking(&external.to_string_lossy(), ImportKind::Merge)
            .await
            .unwrap();

        let handled = tokio::time::timeout(
            Duration::from_secs(2),
            app.handle_action(AppAction::CheckUpdates),
        )
        .await;
        assert!(matches!(handled, Ok(Ok(false))));
        assert!(app.checking_updates);
        assert_eq!(app.poll_update_check().await.unwrap(), None);

        app.handle_action(AppAction::CheckUpdates).await.unwrap();
        assert_eq!(app.status_message(), Some("Update check already running"));
    }

    #[tokio::test]
    async fn font_change_rerenders_open_episode() {
        let dir = tempdir().unwrap();
        let external = dir.path().join("external.db");
        write_external(&external);
        let mut app = App::new(&test_config(dir.path())).await.unwrap();
        app.import_blocking(&external.to_string_lossy(), ImportKind::Merge)
            .await
            .unwrap();

        app.open_episode("n0001aa", 1).await.unwrap();
        app.handle_action(AppAction::FontLarger).await.unwrap();
        app.poll_preferences();
        let reading = &app.reader.as_ref().unwrap().text.runs[1];
        assert_eq!(reading.font_size, 9.0);
    }
}
