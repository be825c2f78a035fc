mod cache;
mod parser;

pub use cache::CatalogCache;
pub use parser::CatalogEntry;
