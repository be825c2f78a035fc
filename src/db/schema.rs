pub const SCHEMA: &str = r#"
-- novel descriptions
CREATE TABLE IF NOT EXISTS novels_descs (
    ncode TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    author TEXT NOT NULL DEFAULT '',
    synopsis TEXT NOT NULL DEFAULT '',
    main_tags TEXT NOT NULL DEFAULT '',
    sub_tags TEXT NOT NULL DEFAULT '',
    rating INTEGER NOT NULL DEFAULT 0,
    total_ep INTEGER NOT NULL DEFAULT 0,
    general_lastup TEXT NOT NULL DEFAULT (datetime('now'))
);

-- episodes; episode_no is text but ordered with CAST(episode_no AS INTEGER)
CREATE TABLE IF NOT EXISTS episodes (
    ncode TEXT NOT NULL,
    episode_no TEXT NOT NULL,
    e_title TEXT NOT NULL DEFAULT '',
    body TEXT NOT NULL DEFAULT '',
    update_time TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (ncode, episode_no)
);

CREATE INDEX IF NOT EXISTS idx_episodes_ncode ON episodes(ncode);

-- one current bookmark per novel
CREATE TABLE IF NOT EXISTS last_read_novel (
    ncode TEXT PRIMARY KEY NOT NULL,
    date TEXT NOT NULL,
    episode_no INTEGER NOT NULL DEFAULT 0
);

-- novels whose source has more episodes than recorded locally
CREATE TABLE IF NOT EXISTS update_queue (
    ncode TEXT PRIMARY KEY NOT NULL,
    total_ep INTEGER NOT NULL,
    detected_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Tables the row merge reads from an external database.
pub const NOVELS_TABLE: &str = "novels_descs";
pub const EPISODES_TABLE: &str = "episodes";
pub const LAST_READ_TABLE: &str = "last_read_novel";
pub const UPDATE_QUEUE_TABLE: &str = "update_queue";
