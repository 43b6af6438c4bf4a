//! Substring search over decrypted history records
//!
//! Case-insensitive matching against title, URL, and page summary.
//! Tombstoned records are never returned. Each hit carries a context
//! snippet around the matched text so callers can display why a record
//! matched without holding the full summary.

use serde::{Deserialize, Serialize};

use crate::types::HistoryRecord;

/// Characters of surrounding context on each side of a match
const CONTEXT_WINDOW: usize = 40;

/// One matched region within a record field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    /// Which field matched: "title", "url", or "summary"
    pub field: String,
    /// The matched text as it appears in the record
    pub text: String,
    /// Snippet of surrounding text containing the match
    pub context: String,
}

/// A record returned from a search, with every field that matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// The matching record
    pub record: HistoryRecord,
    /// All matched regions, one per matching field
    pub matches: Vec<SearchMatch>,
}

/// Search a set of records for a query substring.
///
/// Returns one [`SearchHit`] per record with at least one match.
/// Empty queries match nothing. Tombstoned records are excluded.
pub fn search_records<'a, I>(records: I, query: &str) -> Vec<SearchHit>
where
    I: IntoIterator<Item = &'a HistoryRecord>,
{
    if query.is_empty() {
        return Vec::new();
    }
    let needle = query.to_lowercase();

    let mut hits = Vec::new();
    for record in records {
        if record.deleted {
            continue;
        }

        let mut matches = Vec::new();
        for (field, text) in [
            ("title", Some(record.title.as_str())),
            ("url", Some(record.url.as_str())),
            (
                "summary",
                record.page_content.as_ref().map(|c| c.summary.as_str()),
            ),
        ] {
            if let Some(text) = text {
                if let Some(m) = match_in_field(field, text, &needle) {
                    matches.push(m);
                }
            }
        }

        if !matches.is_empty() {
            hits.push(SearchHit {
                record: record.clone(),
                matches,
            });
        }
    }
    hits
}

/// Find the first occurrence of `needle` (lowercase) in `text` and build
/// a match with surrounding context.
fn match_in_field(field: &str, text: &str, needle: &str) -> Option<SearchMatch> {
    let haystack = text.to_lowercase();
    let start = haystack.find(needle)?;

    // The lowercased haystack can shift byte offsets relative to the
    // original text (e.g. İ lowercases to two bytes), so slice offsets are
    // clamped to character boundaries of whichever string they index.
    let end = start + needle.len();
    let (start, end) = if text.is_char_boundary(start) && start + needle.len() <= text.len() {
        (start, floor_boundary(text, end))
    } else {
        (floor_boundary(text, start), floor_boundary(text, end))
    };

    let ctx_start = floor_boundary(text, start.saturating_sub(CONTEXT_WINDOW));
    let ctx_end = floor_boundary(text, (end + CONTEXT_WINDOW).min(text.len()));

    let mut context = String::new();
    if ctx_start > 0 {
        context.push_str("...");
    }
    context.push_str(&text[ctx_start..ctx_end]);
    if ctx_end < text.len() {
        context.push_str("...");
    }

    Some(SearchMatch {
        field: field.to_string(),
        text: text[start..end].to_string(),
        context,
    })
}

/// Largest char boundary at or below `index`.
fn floor_boundary(text: &str, index: usize) -> usize {
    let mut i = index.min(text.len());
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HistoryRecord;

    fn record_with_summary(visit_id: &str, summary: &str) -> HistoryRecord {
        let mut r = HistoryRecord::new("https://example.com/docs", "Example Docs", "device-a");
        r.visit_id = visit_id.to_string();
        r.attach_summary(summary);
        r
    }

    #[test]
    fn test_search_matches_summary() {
        let records = vec![
            record_with_summary("1", "a page containing unique test content somewhere inside"),
            record_with_summary("2", "nothing of interest here"),
        ];

        let hits = search_records(&records, "unique test content");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.visit_id, "1");
        let m = hits[0].matches.iter().find(|m| m.field == "summary").unwrap();
        assert_eq!(m.text, "unique test content");
        assert!(m.context.contains("unique test content"));
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let records = vec![record_with_summary("1", "The Quick Brown Fox")];
        let hits = search_records(&records, "quick brown");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].matches[0].text, "Quick Brown");
    }

    #[test]
    fn test_search_excludes_tombstones() {
        let mut tombstoned = record_with_summary("1", "unique test content");
        tombstoned.tombstone();
        let live = record_with_summary("2", "unique test content");

        let hits = search_records([&tombstoned, &live], "unique test content");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.visit_id, "2");
    }

    #[test]
    fn test_search_matches_title_and_url() {
        let record = HistoryRecord::new("https://rust-lang.org/learn", "Learn Rust", "device-a");
        let hits = search_records([&record], "rust");

        assert_eq!(hits.len(), 1);
        let fields: Vec<_> = hits[0].matches.iter().map(|m| m.field.as_str()).collect();
        assert!(fields.contains(&"title"));
        assert!(fields.contains(&"url"));
    }

    #[test]
    fn test_context_window_truncates_long_text() {
        let long = format!("{} NEEDLE {}", "x".repeat(200), "y".repeat(200));
        let records = vec![record_with_summary("1", &long)];

        let hits = search_records(&records, "needle");
        let m = &hits[0].matches[0];

        assert!(m.context.starts_with("..."));
        assert!(m.context.ends_with("..."));
        assert!(m.context.contains("NEEDLE"));
        assert!(m.context.len() < long.len());
    }

    #[test]
    fn test_context_on_multibyte_text() {
        let summary = "日本語のテキストの中に unique という単語が含まれています";
        let records = vec![record_with_summary("1", summary)];

        let hits = search_records(&records, "unique");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].matches[0].context.contains("unique"));
    }

    #[test]
    fn test_empty_query_matches_nothing() {
        let records = vec![record_with_summary("1", "anything")];
        assert!(search_records(&records, "").is_empty());
    }

    #[test]
    fn test_no_match_returns_empty() {
        let records = vec![record_with_summary("1", "some summary")];
        assert!(search_records(&records, "absent phrase").is_empty());
    }
}
