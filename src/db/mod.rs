mod repository;
pub mod schema;

pub(crate) use repository::datetime_from_epoch;
pub use repository::{parse_datetime, Repository};
