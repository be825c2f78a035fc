mod narou;

pub use narou::{diff_updates, NarouClient, RemoteStatus};
