use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};

use crate::app::{App, View};
use crate::ruby::{AnnotatedText, RunKind};

pub fn draw(frame: &mut Frame, app: &App) {
    match app.view {
        View::Reader => render_reader(frame, app, frame.area()),
        _ => render_lists(frame, app),
    }

    if app.import_input_active {
        render_import_input(frame, app);
    }

    if app.progress.is_some() {
        render_progress(frame, app);
    }

    if app.show_help {
        render_help(frame);
    }
}

fn render_lists(frame: &mut Frame, app: &App) {
    // 1/3 list, 2/3 details
    let main_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Ratio(1, 3), Constraint::Ratio(2, 3)])
        .split(frame.area());

    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Title bar
            Constraint::Min(0),    // List
            Constraint::Length(1), // Status line
        ])
        .split(main_chunks[0]);

    render_header(frame, app, left_chunks[0]);
    match app.view {
        View::Episodes => render_episode_list(frame, app, left_chunks[1]),
        View::Catalog => render_catalog(frame, app, left_chunks[1]),
        View::UpdateQueue => render_update_queue(frame, app, left_chunks[1]),
        _ => render_novel_list(frame, app, left_chunks[1]),
    }
    render_status(frame, app, left_chunks[2]);
    render_details(frame, app, main_chunks[1]);
}

fn render_header(frame: &mut Frame, app: &App, area: Rect) {
    let (title, stats) = match app.view {
        View::Episodes => (
            " Episodes ".to_string(),
            format!(" {} stored", app.episodes.len()),
        ),
        View::Catalog => (
            " Catalog ".to_string(),
            format!(" {} novels", app.catalog.len()),
        ),
        View::UpdateQueue => (
            " Updates ".to_string(),
            format!(" {} novels with new episodes", app.update_queue.len()),
        ),
        _ => {
            let unread: i64 = app.novels.iter().map(|n| n.unread_count()).sum();
            (
                " Library ".to_string(),
                format!(" {} Novels | {} Unread episodes", app.novels.len(), unread),
            )
        }
    };

    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let inner = block.inner(area);
    frame.render_widget(block, area);
    frame.render_widget(Paragraph::new(stats).style(Style::default().fg(Color::White)), inner);
}

fn render_list(frame: &mut Frame, area: Rect, items: Vec<ListItem>, selected: usize) {
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL))
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");

    let mut state = ListState::default();
    state.select(Some(selected));
    frame.render_stateful_widget(list, area, &mut state);
}

fn render_novel_list(frame: &mut Frame, app: &App, area: Rect) {
    let items = app
        .novels
        .iter()
        .map(|novel| {
            let unread = novel.unread_count();
            let style = if unread == 0 {
                Style::default().fg(Color::DarkGray)
            } else {
                Style::default().fg(Color::White)
            };
            ListItem::new(Line::from(vec![
                Span::styled(format!("{unread:>4} "), Style::default().fg(Color::Yellow)),
                Span::styled(novel.title.as_str(), style),
            ]))
        })
        .collect();
    render_list(frame, area, items, app.selected_index);
}

fn render_episode_list(frame: &mut Frame, app: &App, area: Rect) {
    let last_read = app
        .selected_novel()
        .map(|n| n.last_read_episode)
        .unwrap_or(0);
    let items = app
        .episodes
        .iter()
        .map(|episode| {
            let style = if episode.number() <= last_read {
                Style::default().fg(Color::DarkGray)
            } else {
                Style::default().fg(Color::White)
            };
            ListItem::new(Line::from(vec![
                Span::styled(format!("{:>4} ", episode.episode_no), Style::default().fg(Color::Blue)),
                Span::styled(episode.title.as_str(), style),
            ]))
        })
        .collect();
    render_list(frame, area, items, app.episode_index);
}

fn render_catalog(frame: &mut Frame, app: &App, area: Rect) {
    let items = app
        .catalog
        .iter()
        .map(|entry| {
            let mark = if app.is_in_library(&entry.ncode) { "✓ " } else { "  " };
            ListItem::new(Line::from(vec![
                Span::styled(mark, Style::default().fg(Color::Green)),
                Span::styled(entry.title.as_str(), Style::default().fg(Color::White)),
            ]))
        })
        .collect();
    render_list(frame, area, items, app.selected_index);
}

fn render_update_queue(frame: &mut Frame, app: &App, area: Rect) {
    let items = app
        .update_queue
        .iter()
        .map(|entry| {
            let title = app
                .novels
                .iter()
                .find(|n| n.ncode == entry.ncode)
                .map(|n| n.title.as_str())
                .unwrap_or(entry.ncode.as_str());
            ListItem::new(Line::from(vec![
                Span::styled(format!("{:>4} ", entry.total_episodes), Style::default().fg(Color::Yellow)),
                Span::styled(title, Style::default().fg(Color::White)),
            ]))
        })
        .collect();
    render_list(frame, area, items, app.selected_index);
}

fn render_status(frame: &mut Frame, app: &App, area: Rect) {
    let idle = if app.checking_updates {
        "Checking for updates..."
    } else {
        match app.view {
            View::Episodes => "Enter:read  Esc:back  ?:help",
            View::Catalog => "o:open  Esc:back  ?:help",
            View::UpdateQueue => "Enter:open  d:dismiss  Esc:back  ?:help",
            _ => "j/k:nav  i:import  U:check updates  ?:help  q:quit",
        }
    };
    let status = app.status_message().unwrap_or(idle);

    frame.render_widget(Paragraph::new(status).style(Style::default().fg(Color::DarkGray)), area);
}

fn render_details(frame: &mut Frame, app: &App, area: Rect) {
    let mut lines = Vec::new();
    let title = match app.view {
        View::Catalog => {
            if let Some(entry) = app.catalog.get(app.selected_index) {
                lines.push(Line::from(entry.title.as_str()));
                lines.push(Line::from(Span::styled(
                    entry.ncode.as_str(),
                    Style::default().fg(Color::Blue),
                )));
            }
            " Catalog entry "
        }
        _ => {
            if let Some(novel) = app.selected_novel() {
                lines.push(Line::from(Span::styled(
                    novel.title.as_str(),
                    Style::default().add_modifier(Modifier::BOLD),
                )));
                lines.push(Line::from(Span::styled(
                    format!("{} | {}", novel.author, novel.ncode),
                    Style::default().fg(Color::Blue),
                )));
                lines.push(Line::from(format!(
                    "Read {}/{} | Rating {} | Updated {}",
                    novel.last_read_episode,
                    novel.total_episodes,
                    novel.rating,
                    novel.last_update.format("%Y-%m-%d")
                )));
                let tags: Vec<&str> = novel
                    .main_tags
                    .iter()
                    .chain(novel.sub_tags.iter())
                    .map(String::as_str)
                    .collect();
                if !tags.is_empty() {
                    lines.push(Line::from(Span::styled(
                        tags.join(" "),
                        Style::default().fg(Color::Yellow),
                    )));
                }
                lines.push(Line::from(""));
                lines.extend(novel.synopsis.lines().map(|l| Line::from(l.to_string())));
            }
            " Novel "
        }
    };

    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Magenta));

    let paragraph = Paragraph::new(lines).block(block).wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}

fn render_reader(frame: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(area);

    let Some(reader) = &app.reader else {
        return;
    };

    let block = Block::default()
        .title(format!(" {} | {} ", reader.episode_no, reader.title))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let paragraph = Paragraph::new(styled_lines(&reader.text))
        .block(block)
        .wrap(Wrap { trim: false })
        .scroll((reader.scroll, 0));
    frame.render_widget(paragraph, chunks[0]);

    let status = app
        .status_message()
        .unwrap_or("j/k:scroll  n/p:next/prev  +/-:font  Esc:back");
    frame.render_widget(Paragraph::new(status).style(Style::default().fg(Color::DarkGray)), chunks[1]);
}

/// Terminal cells have one size, so readings are drawn dimmed in brackets
/// right after their base.
fn styled_lines(text: &AnnotatedText) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut spans = Vec::new();
    for run in &text.runs {
        match run.kind {
            RunKind::Text => spans.push(Span::raw(run.text.as_str())),
            RunKind::RubyBase => spans.push(Span::styled(
                run.text.as_str(),
                Style::default().add_modifier(Modifier::UNDERLINED),
            )),
            RunKind::RubyReading => spans.push(Span::styled(
                format!("《{}》", run.text),
                Style::default().fg(Color::DarkGray),
            )),
            RunKind::LineBreak => lines.push(Line::from(std::mem::take(&mut spans))),
        }
    }
    if !spans.is_empty() {
        lines.push(Line::from(spans));
    }
    lines
}

fn render_import_input(frame: &mut Frame, app: &App) {
    let area = centered_rect(60, 20, frame.area());
    let mode = if app.prefs.current().copy_mode {
        "replace database"
    } else {
        "merge rows"
    };

    let block = Block::default()
        .title(format!(" Import external database ({mode}) - path or URL "))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let inner = block.inner(area);

    frame.render_widget(Clear, area);
    frame.render_widget(block, area);

    let input_text = format!("> {}_", app.import_input);
    frame.render_widget(Paragraph::new(input_text).style(Style::default().fg(Color::White)), inner);
}

fn render_progress(frame: &mut Frame, app: &App) {
    let Some(progress) = &app.progress else {
        return;
    };
    let area = centered_rect(60, 15, frame.area());

    let block = Block::default()
        .title(" Importing - Esc to cancel ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    frame.render_widget(Clear, area);
    match progress.fraction {
        Some(fraction) => {
            let gauge = Gauge::default()
                .block(block)
                .gauge_style(Style::default().fg(Color::Green))
                .ratio(f64::from(fraction.clamp(0.0, 1.0)))
                .label(progress.message.as_str());
            frame.render_widget(gauge, area);
        }
        None => {
            let paragraph = Paragraph::new(progress.message.as_str())
                .block(block)
                .style(Style::default().fg(Color::White));
            frame.render_widget(paragraph, area);
        }
    }
}

fn render_help(frame: &mut Frame) {
    let area = centered_rect(50, 70, frame.area());

    let help_text = vec![
        "",
        " Navigation:",
        "   j / ↓    Move down / scroll",
        "   k / ↑    Move up / scroll",
        "   Enter    Open novel / episode",
        "   Esc      Back",
        "   n / p    Next / previous episode",
        "",
        " Actions:",
        "   c        Show / reload catalog",
        "   u        Show update queue",
        "   U        Check for new episodes",
        "   d        Dismiss update / clear position",
        "   o        Open in browser",
        "   + / -    Font size",
        "   i        Import external database",
        "   m        Toggle merge / replace import",
        "",
        " General:",
        "   ?        Toggle this help",
        "   q        Quit",
        "",
        " Press any key to close",
    ];

    let block = Block::default()
        .title(" Help ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let paragraph = Paragraph::new(help_text.join("\n"))
        .block(block)
        .style(Style::default().fg(Color::White));

    frame.render_widget(Clear, area);
    frame.render_widget(paragraph, area);
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ruby::render;

    #[test]
    fn readings_follow_their_base() {
        let text = render("｜漢字《かんじ》です\n次", 16.0, 8.0);
        let lines = styled_lines(&text);
        assert_eq!(lines.len(), 2);
        let first: String = lines[0].spans.iter().map(|s| s.content.as_ref()).collect();
        assert_eq!(first, "漢字《かんじ》です");
    }
}
