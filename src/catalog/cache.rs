use std::sync::Arc;

use super::parser::{parse_catalog, resolve_source, CatalogEntry, CatalogError};

/// Remembers the list parsed from the most recent source only. Loading a
/// different source drops it; failures are never cached.
#[derive(Default)]
pub struct CatalogCache {
    entry: Option<(String, Arc<Vec<CatalogEntry>>)>,
    parses: usize,
}

impl CatalogCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(&mut self, source: &str) -> Result<Arc<Vec<CatalogEntry>>, CatalogError> {
        let path = resolve_source(source)?;
        let key = path.to_string_lossy().to_string();

        if let Some((cached_key, entries)) = &self.entry {
            if *cached_key == key {
                tracing::debug!("Catalog cache hit for {}", key);
                return Ok(Arc::clone(entries));
            }
        }
        self.entry = None;

        if !path.exists() {
            return Err(CatalogError::NotFound(key));
        }

        self.parses += 1;
        let html = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CatalogError::Unreadable(e.to_string()))?;
        if html.trim().is_empty() {
            return Err(CatalogError::Empty);
        }

        let entries = parse_catalog(&html);
        if entries.is_empty() {
            return Err(CatalogError::NoEntries);
        }
        tracing::debug!("Parsed {} catalog entries from {}", entries.len(), key);

        let entries = Arc::new(entries);
        self.entry = Some((key, Arc::clone(&entries)));
        Ok(entries)
    }

    /// Number of times a snapshot was actually read and parsed.
    pub fn parse_count(&self) -> usize {
        self.parses
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}
