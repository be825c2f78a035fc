use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crossterm::event::KeyEventKind;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::prelude::*;

mod app;
mod catalog;
mod config;
mod converter;
mod db;
mod error;
mod import;
mod models;
mod preferences;
mod ruby;
mod services;
mod tui;

use app::{App, ImportKind, ImportOutcome};
use catalog::CatalogCache;
use config::Config;
use error::{AppError, Result};
use preferences::PreferenceStore;
use services::NarouClient;
use tui::{draw, handle_key_event};

const READ_WIDTH: usize = 80;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (only show warnings and errors by default)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = Config::load()?;

    match args.get(1).map(String::as_str) {
        Some("--convert") => return convert(&config, &args[2..]),
        Some("--catalog") => {
            let source = flag_value(&args, 2, "--catalog <path-or-file-uri>")?;
            return print_catalog(source).await;
        }
        Some("--fetch-catalog") => {
            let url = flag_value(&args, 2, "--fetch-catalog <url> <out>")?;
            let out = flag_value(&args, 3, "--fetch-catalog <url> <out>")?;
            let client = NarouClient::new(config.narou_api_url.clone())?;
            let bytes = client.fetch_page(url, &PathBuf::from(out)).await?;
            println!("Saved {} bytes to {}", bytes, out);
            return Ok(());
        }
        _ => {}
    }

    let mut app = App::new(&config).await?;

    match args.get(1).map(String::as_str) {
        Some("--import") => {
            let source = flag_value(&args, 2, "--import <source>")?;
            if let ImportOutcome::Merged(report) = app.import_blocking(source, ImportKind::Merge).await? {
                println!(
                    "Imported {} novels, {} episodes, {} reading positions ({} rows skipped)",
                    report.novels, report.episodes, report.last_reads, report.skipped
                );
            }
            return Ok(());
        }
        Some("--copy-db") => {
            let source = flag_value(&args, 2, "--copy-db <source>")?;
            if let ImportOutcome::Copied(bytes) = app.import_blocking(source, ImportKind::Copy).await? {
                println!("Replaced {} with {} bytes from {}", config.db_path, bytes, source);
            }
            return Ok(());
        }
        Some("--check-updates") => {
            let queued = app.check_updates().await?;
            println!("{} of {} novels have new episodes", queued, app.novels.len());
            return Ok(());
        }
        Some("--read") => {
            let ncode = flag_value(&args, 2, "--read <ncode> <episode>")?;
            let episode_no = flag_value(&args, 3, "--read <ncode> <episode>")?
                .parse::<i64>()
                .map_err(|e| AppError::Config(format!("invalid episode number: {e}")))?;
            app.open_episode(ncode, episode_no).await?;
            let Some(reader) = &app.reader else {
                return Err(AppError::NotFound(format!("episode {episode_no} of {ncode}")));
            };
            println!("{}\n", reader.title);
            for line in reader.text.inline_text().lines() {
                println!("{}", textwrap::fill(line, READ_WIDTH));
            }
            return Ok(());
        }
        _ => {}
    }

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Run the app
    let result = run_app(&mut terminal, &mut app).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(e) = result {
        eprintln!("Error: {}", e);
    }

    Ok(())
}

fn flag_value<'a>(args: &'a [String], index: usize, usage: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| AppError::Config(format!("usage: nr-reader {usage}")))
}

/// Fields that are missing or do not parse keep their last-used value.
fn convert(config: &Config, fields: &[String]) -> Result<()> {
    let prefs = PreferenceStore::load(&config.prefs_path)?;
    let field = |i: usize| fields.get(i).map(String::as_str).unwrap_or("");
    let inputs = prefs
        .current()
        .converter
        .with_text(field(0), field(1), field(2), field(3));
    let result = inputs.convert();

    println!(
        "{}W {}m{:02}s -> {}W {}",
        inputs.source_watts, inputs.minutes, inputs.seconds, inputs.target_watts, result
    );
    prefs.update(|p| p.converter = inputs)?;
    Ok(())
}

async fn print_catalog(source: &str) -> Result<()> {
    let mut cache = CatalogCache::new();
    match cache.load(source).await {
        Ok(entries) => {
            for entry in entries.iter() {
                println!("{}\t{}", entry.ncode, entry.title);
            }
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("catalog: {e}").into()),
    }
}

async fn run_app<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> Result<()> {
    loop {
        terminal.draw(|frame| draw(frame, app))?;

        // Sample import progress and collect finished imports
        app.poll_import().await;

        // Collect a finished background update check
        app.poll_update_check().await?;

        // Re-render the reader after preference changes
        app.poll_preferences();

        // Poll for events with timeout to allow async operations
        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if let Some(action) =
                        handle_key_event(key, app.import_input_active, app.is_importing(), app.show_help)
                    {
                        let should_quit = app.handle_action(action).await?;
                        if should_quit {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}
