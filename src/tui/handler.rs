use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

#[derive(Debug, Clone)]
pub enum AppAction {
    Quit,
    MoveUp,
    MoveDown,
    Select,
    Back,
    NextEpisode,
    PrevEpisode,
    ShowCatalog,
    ShowUpdateQueue,
    CheckUpdates,
    RemoveEntry,
    OpenInBrowser,
    FontLarger,
    FontSmaller,
    ToggleCopyMode,
    ShowHelp,
    HideHelp,
    // Import input actions
    ImportStart,
    ImportInputChar(char),
    ImportInputBackspace,
    ImportInputConfirm,
    ImportInputCancel,
    CancelImport,
}

pub fn handle_key_event(
    key: KeyEvent,
    import_input_active: bool,
    importing: bool,
    show_help: bool,
) -> Option<AppAction> {
    // If help is showing, any key closes it
    if show_help {
        return Some(AppAction::HideHelp);
    }

    // Import source prompt
    if import_input_active {
        return match key.code {
            KeyCode::Enter => Some(AppAction::ImportInputConfirm),
            KeyCode::Esc => Some(AppAction::ImportInputCancel),
            KeyCode::Backspace => Some(AppAction::ImportInputBackspace),
            KeyCode::Char(c) => Some(AppAction::ImportInputChar(c)),
            _ => None,
        };
    }

    // Esc in the progress popup cancels the import
    if importing && key.code == KeyCode::Esc {
        return Some(AppAction::CancelImport);
    }

    // Normal mode
    match (key.code, key.modifiers) {
        (KeyCode::Char('q'), _) => Some(AppAction::Quit),
        (KeyCode::Char('c'), KeyModifiers::CONTROL) => Some(AppAction::Quit),

        (KeyCode::Char('j'), _) | (KeyCode::Down, _) => Some(AppAction::MoveDown),
        (KeyCode::Char('k'), _) | (KeyCode::Up, _) => Some(AppAction::MoveUp),
        (KeyCode::Char('n'), _) | (KeyCode::Right, _) => Some(AppAction::NextEpisode),
        (KeyCode::Char('p'), _) | (KeyCode::Left, _) => Some(AppAction::PrevEpisode),

        (KeyCode::Enter, _) => Some(AppAction::Select),
        (KeyCode::Esc, _) | (KeyCode::Backspace, _) => Some(AppAction::Back),

        (KeyCode::Char('c'), _) => Some(AppAction::ShowCatalog),
        (KeyCode::Char('u'), KeyModifiers::NONE) => Some(AppAction::ShowUpdateQueue),
        (KeyCode::Char('U'), _) => Some(AppAction::CheckUpdates),
        (KeyCode::Char('d'), _) => Some(AppAction::RemoveEntry),
        (KeyCode::Char('o'), _) => Some(AppAction::OpenInBrowser),
        (KeyCode::Char('+'), _) | (KeyCode::Char('='), _) => Some(AppAction::FontLarger),
        (KeyCode::Char('-'), _) => Some(AppAction::FontSmaller),
        (KeyCode::Char('m'), _) => Some(AppAction::ToggleCopyMode),
        (KeyCode::Char('i'), _) => Some(AppAction::ImportStart),

        (KeyCode::Char('?'), _) => Some(AppAction::ShowHelp),

        _ => None,
    }
}
