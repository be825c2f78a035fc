use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub ncode: String,
    pub title: String,
}

/// Why a catalog snapshot produced no list. `NoEntries` means the page was
/// read but held no novel cards.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("catalog snapshot not found: {0}")]
    NotFound(String),

    #[error("unsupported catalog source scheme: {0}")]
    UnsupportedScheme(String),

    #[error("catalog snapshot unreadable: {0}")]
    Unreadable(String),

    #[error("catalog snapshot is empty")]
    Empty,

    #[error("no novels found in catalog snapshot")]
    NoEntries,
}

fn anchor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*["']([^"']*)["'][^>]*>(.*?)</a\s*>"#)
            .expect("valid anchor regex")
    })
}

fn ncode_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:^|/)(n\d{4}[a-z]{1,3})(?:[/?#]|$)").expect("valid ncode regex")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid tag regex"))
}

/// Turn a plain path or `file://` URI into a local path.
pub fn resolve_source(source: &str) -> Result<PathBuf, CatalogError> {
    let source = source.trim();
    match source.split_once("://") {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("file") => {
            let decoded = urlencoding::decode(rest)
                .map_err(|e| CatalogError::Unreadable(e.to_string()))?;
            Ok(PathBuf::from(decoded.into_owned()))
        }
        Some((scheme, _)) => Err(CatalogError::UnsupportedScheme(scheme.to_string())),
        None => Ok(PathBuf::from(source)),
    }
}

/// Extract novel cards: every link whose target carries an ncode segment.
/// The first titled link per ncode wins.
pub fn parse_catalog(html: &str) -> Vec<CatalogEntry> {
    let mut entries: Vec<CatalogEntry> = Vec::new();

    for caps in anchor_re().captures_iter(html) {
        let Some(ncode) = ncode_re()
            .captures(&caps[1])
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_lowercase())
        else {
            continue;
        };
        if entries.iter().any(|e| e.ncode == ncode) {
            continue;
        }
        let title = card_title(&caps[2]);
        if title.is_empty() {
            continue;
        }
        entries.push(CatalogEntry { ncode, title });
    }

    entries
}

fn card_title(inner_html: &str) -> String {
    let text = tag_re().replace_all(inner_html, " ");
    let text = if text.contains('&') {
        html2text::from_read(text.as_bytes(), usize::from(u16::MAX))
            .unwrap_or_else(|_| text.to_string())
    } else {
        text.into_owned()
    };
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"
        <div class="searchkekka_box">
          <div class="novel_h"><a class="tl" href="https://ncode.syosetu.com/N1234AB/">異世界 <b>勇者</b></a></div>
          <a href="https://ncode.syosetu.com/n1234ab/1/">第1話</a>
        </div>
        <div class="searchkekka_box">
          <div class="novel_h"><a href='/n5678cde/'>Tom &amp; Jerry</a></div>
        </div>
        <a href="https://syosetu.com/help/">help</a>
        <a href="https://ncode.syosetu.com/n0001aa/"><img src="x.png"></a>
    "#;

    #[test]
    fn extracts_cards_in_order() {
        let entries = parse_catalog(SNAPSHOT);
        assert_eq!(
            entries,
            vec![
                CatalogEntry { ncode: "n1234ab".into(), title: "異世界 勇者".into() },
                CatalogEntry { ncode: "n5678cde".into(), title: "Tom & Jerry".into() },
            ]
        );
    }

    #[test]
    fn page_without_cards_is_empty() {
        assert!(parse_catalog("<html><body><p>nothing</p></body></html>").is_empty());
    }

    #[test]
    fn resolves_paths_and_file_uris() {
        assert_eq!(resolve_source("/tmp/a.html").unwrap(), PathBuf::from("/tmp/a.html"));
        assert_eq!(
            resolve_source("file:///tmp/my%20list.html").unwrap(),
            PathBuf::from("/tmp/my list.html")
        );
        assert_eq!(
            resolve_source("content://provider/doc").unwrap_err(),
            CatalogError::UnsupportedScheme("content".into())
        );
    }
}
