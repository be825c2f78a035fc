mod novel;

pub use novel::{join_tags, split_tags, Episode, Imported, LastRead, Novel, UpdateQueueEntry};
